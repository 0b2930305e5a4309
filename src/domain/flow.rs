// ==========================================
// 生产批次追溯引擎 - 工艺流程版本
// ==========================================
// 只有 PUBLISHED 状态的版本可以创建生产运行
// ==========================================

use crate::domain::types::FlowVersionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 标准流程的工序定义 (node_id, 名称)
///
/// 序号即数组下标,0..=10
pub const CANONICAL_FLOW_STEPS: [(&str, &str); 11] = [
    ("start", "开工准备"),
    ("step-1", "原料接收"),
    ("step-2", "剔骨"),
    ("step-3", "散装缓冲"),
    ("step-4", "混料"),
    ("step-5", "穿串"),
    ("step-6", "速冻"),
    ("step-7", "包装"),
    ("step-8", "码垛"),
    ("step-9", "冷库存储"),
    ("step-10", "发货"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub index: i32,
    pub node_id: String,
    pub name: String,
    pub qc_gate_id: Option<String>, // 绑定的质检关卡
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
    pub flow_version_id: String,
    pub name: String,
    pub status: FlowVersionStatus,
    pub steps: Vec<FlowStep>, // 按 index 升序
    pub created_at: DateTime<Utc>,
}

impl FlowVersion {
    /// 最终工序序号 (空流程返回 None)
    pub fn final_step_index(&self) -> Option<i32> {
        self.steps.last().map(|s| s.index)
    }

    pub fn step(&self, index: i32) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn is_published(&self) -> bool {
        self.status == FlowVersionStatus::Published
    }
}
