//! Analysis prompts keyed by media kind and item count.

use crate::models::MediaKind;

const VIDEO_PROMPT: &str = "你是一名专业的运动姿态分析教练。请仔细观看这段运动视频，\
分析运动员的身体姿态与动作技术，内容包括：\n\
1. 动作概述：识别运动项目和主要动作阶段；\n\
2. 姿态评估：头部、躯干、肩、髋、膝、踝等关键部位的角度与对齐情况；\n\
3. 问题识别：指出存在的技术缺陷或潜在受伤风险，并注明出现的大致时间点；\n\
4. 改进建议：给出具体、可执行的纠正练习与训练要点。\n\
请使用清晰的小标题和条目组织回答。";

const SINGLE_IMAGE_PROMPT: &str = "你是一名专业的运动姿态分析教练。请分析这张运动图片中人物的身体姿态，\
内容包括：\n\
1. 识别运动项目与当前动作；\n\
2. 评估头部、躯干、肩、髋、膝、踝等关键部位的角度与对齐情况；\n\
3. 指出技术缺陷或潜在受伤风险；\n\
4. 给出具体、可执行的改进建议。\n\
请使用清晰的小标题和条目组织回答。";

/// Build the prompt for analysing `item_count` items of `kind` together.
pub fn build_prompt(kind: MediaKind, item_count: usize) -> String {
    match kind {
        MediaKind::Video => VIDEO_PROMPT.to_string(),
        MediaKind::Image if item_count <= 1 => SINGLE_IMAGE_PROMPT.to_string(),
        MediaKind::Image => format!(
            "你是一名专业的运动姿态分析教练。以下是{count}张图片对比，按上传顺序编号为图1至图{count}。\
请逐张分析人物的身体姿态，然后进行对比：\n\
1. 分别概述每张图片中的运动项目与动作；\n\
2. 对比各图中头部、躯干、肩、髋、膝、踝等关键部位的角度与对齐差异；\n\
3. 指出各图中存在的技术缺陷或潜在受伤风险，说明哪张图的姿态更合理及原因；\n\
4. 给出具体、可执行的改进建议。\n\
请使用清晰的小标题和条目组织回答。",
            count = item_count
        ),
    }
}
