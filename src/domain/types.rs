// ==========================================
// 生产批次追溯引擎 - 领域类型定义
// ==========================================
// 红线: 所有状态/类型字段均为封闭枚举,边界处拒绝未知值
// 序列化格式: 与数据库存储字符串一致
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 批次类型 (Lot Type)
// ==========================================
// 存储代码: RAW / DEB / BULK / MIX / SKW / FRZ / FG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LotType {
    #[serde(rename = "RAW")]
    Raw, // 原料
    #[serde(rename = "DEB")]
    Deboned, // 剔骨肉
    #[serde(rename = "BULK")]
    BulkMix, // 散装中间料
    #[serde(rename = "MIX")]
    FinalMix, // 终混料
    #[serde(rename = "SKW")]
    Skewer, // 串制品
    #[serde(rename = "FRZ")]
    Frozen, // 速冻品
    #[serde(rename = "FG")]
    FinishedGood, // 成品
}

impl LotType {
    /// 从数据库字符串解析（未知值返回 None）
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "RAW" => Some(LotType::Raw),
            "DEB" => Some(LotType::Deboned),
            "BULK" => Some(LotType::BulkMix),
            "MIX" => Some(LotType::FinalMix),
            "SKW" => Some(LotType::Skewer),
            "FRZ" => Some(LotType::Frozen),
            "FG" => Some(LotType::FinishedGood),
            _ => None,
        }
    }

    /// 转换为数据库存储的字符串
    pub fn to_db_str(&self) -> &'static str {
        match self {
            LotType::Raw => "RAW",
            LotType::Deboned => "DEB",
            LotType::BulkMix => "BULK",
            LotType::FinalMix => "MIX",
            LotType::Skewer => "SKW",
            LotType::Frozen => "FRZ",
            LotType::FinishedGood => "FG",
        }
    }
}

impl fmt::Display for LotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 生产运行状态 (Run Status)
// ==========================================
// IDLE → RUNNING → {HOLD ↔ RUNNING} → COMPLETED
// 非终态均可 → ABORTED; 终态可归档 → ARCHIVED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Idle,      // 已创建未启动
    Running,   // 执行中
    Hold,      // 暂停
    Completed, // 已完成
    Aborted,   // 已中止
    Archived,  // 已归档
}

impl RunStatus {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "IDLE" => Some(RunStatus::Idle),
            "RUNNING" => Some(RunStatus::Running),
            "HOLD" => Some(RunStatus::Hold),
            "COMPLETED" => Some(RunStatus::Completed),
            "ABORTED" => Some(RunStatus::Aborted),
            "ARCHIVED" => Some(RunStatus::Archived),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "IDLE",
            RunStatus::Running => "RUNNING",
            RunStatus::Hold => "HOLD",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Aborted => "ABORTED",
            RunStatus::Archived => "ARCHIVED",
        }
    }

    /// 终态: 不再接受任何业务变更 (归档状态同样视为终态)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Archived
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 工序执行状态 (Step Execution Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl StepExecutionStatus {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Some(StepExecutionStatus::Pending),
            "IN_PROGRESS" => Some(StepExecutionStatus::InProgress),
            "COMPLETED" => Some(StepExecutionStatus::Completed),
            "SKIPPED" => Some(StepExecutionStatus::Skipped),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            StepExecutionStatus::Pending => "PENDING",
            StepExecutionStatus::InProgress => "IN_PROGRESS",
            StepExecutionStatus::Completed => "COMPLETED",
            StepExecutionStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 质检结论 (QC Decision)
// ==========================================
// 红线: HOLD / FAIL 必须附带不少于 10 个字符的说明
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pass,
    Hold,
    Fail,
}

impl Decision {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PASS" => Some(Decision::Pass),
            "HOLD" => Some(Decision::Hold),
            "FAIL" => Some(Decision::Fail),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            Decision::Pass => "PASS",
            Decision::Hold => "HOLD",
            Decision::Fail => "FAIL",
        }
    }

    /// 是否需要书面说明
    pub fn requires_notes(&self) -> bool {
        matches!(self, Decision::Hold | Decision::Fail)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 质检关卡类型 (Gate Type)
// ==========================================
// 只有 BLOCKING 类型可以阻断工序推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateType {
    Info,
    Checkpoint,
    Blocking,
}

impl GateType {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "INFO" => Some(GateType::Info),
            "CHECKPOINT" => Some(GateType::Checkpoint),
            "BLOCKING" => Some(GateType::Blocking),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            GateType::Info => "INFO",
            GateType::Checkpoint => "CHECKPOINT",
            GateType::Blocking => "BLOCKING",
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 工艺版本状态 (Flow Version Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowVersionStatus {
    Draft,
    Published,
    Deprecated,
}

impl FlowVersionStatus {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DRAFT" => Some(FlowVersionStatus::Draft),
            "PUBLISHED" => Some(FlowVersionStatus::Published),
            "DEPRECATED" => Some(FlowVersionStatus::Deprecated),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            FlowVersionStatus::Draft => "DRAFT",
            FlowVersionStatus::Published => "PUBLISHED",
            FlowVersionStatus::Deprecated => "DEPRECATED",
        }
    }
}

impl fmt::Display for FlowVersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

// ==========================================
// 谱系遍历方向 (Traversal Direction)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalDirection {
    Backward, // 追溯父批次 (上游)
    Forward,  // 追踪子批次 (下游)
    Both,     // 双向
}

impl fmt::Display for TraversalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversalDirection::Backward => write!(f, "backward"),
            TraversalDirection::Forward => write!(f, "forward"),
            TraversalDirection::Both => write!(f, "both"),
        }
    }
}

// ==========================================
// 温度测量类型 (Measurement Type)
// ==========================================
// 超限阈值: 表面 > 4.0°C; 中心 / 环境 > -18.0°C
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementType {
    Surface, // 表面温度
    Core,    // 中心温度
    Ambient, // 环境温度
}

impl MeasurementType {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "SURFACE" => Some(MeasurementType::Surface),
            "CORE" => Some(MeasurementType::Core),
            "AMBIENT" => Some(MeasurementType::Ambient),
            _ => None,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            MeasurementType::Surface => "SURFACE",
            MeasurementType::Core => "CORE",
            MeasurementType::Ambient => "AMBIENT",
        }
    }

    /// 允许的最高温度 (°C),严格大于即超限
    pub fn max_allowed_c(&self) -> f64 {
        match self {
            MeasurementType::Surface => 4.0,
            MeasurementType::Core | MeasurementType::Ambient => -18.0,
        }
    }

    pub fn is_violation(&self, temperature_c: f64) -> bool {
        temperature_c > self.max_allowed_c()
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lot_type_db_codes() {
        for lot_type in [
            LotType::Raw,
            LotType::Deboned,
            LotType::BulkMix,
            LotType::FinalMix,
            LotType::Skewer,
            LotType::Frozen,
            LotType::FinishedGood,
        ] {
            assert_eq!(LotType::from_db_str(lot_type.to_db_str()), Some(lot_type));
        }
        assert_eq!(LotType::from_db_str("PAL"), None);
    }

    #[test]
    fn test_unknown_decision_rejected_at_boundary() {
        let parsed: Result<Decision, _> = serde_json::from_str("\"MAYBE\"");
        assert!(parsed.is_err());

        let parsed: Decision = serde_json::from_str("\"HOLD\"").unwrap();
        assert_eq!(parsed, Decision::Hold);
        assert!(parsed.requires_notes());
        assert!(!Decision::Pass.requires_notes());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Hold.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(RunStatus::Archived.is_terminal());
    }

    #[test]
    fn test_lot_type_serde_uses_db_code() {
        let json = serde_json::to_string(&LotType::FinalMix).unwrap();
        assert_eq!(json, "\"MIX\"");
    }

    #[test]
    fn test_measurement_thresholds() {
        assert!(!MeasurementType::Surface.is_violation(4.0));
        assert!(MeasurementType::Surface.is_violation(4.1));
        assert!(!MeasurementType::Core.is_violation(-18.0));
        assert!(MeasurementType::Core.is_violation(-17.9));
        assert!(MeasurementType::Ambient.is_violation(-10.0));
        assert!(!MeasurementType::Ambient.is_violation(-22.5));
        assert_eq!(MeasurementType::from_db_str("core"), Some(MeasurementType::Core));
        assert_eq!(MeasurementType::from_db_str("INFRARED"), None);
    }
}
