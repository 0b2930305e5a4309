// ==========================================
// 生产批次追溯引擎 - 合规规则检查器
// ==========================================
// 职责: 在批次进入工序前评估一组独立的合规规则
// 规则: 纯函数,只依赖拟登记的组成关系与当前日期
// 顺序: 按注册顺序确定性评估,首个违规即短路
// ==========================================

use crate::domain::lot::Lot;
use crate::domain::types::LotType;
use crate::engine::error::{EngineError, EngineResult};
use chrono::{FixedOffset, NaiveDate};
use std::sync::Arc;
use tracing::warn;

// ==========================================
// CompositionContext - 拟登记的组成关系
// ==========================================
#[derive(Debug, Clone)]
pub struct CompositionContext<'a> {
    pub lot_type: LotType,         // 新批次类型
    pub parents: &'a [Lot],        // 声明的父批次
    pub production_date: NaiveDate, // 当前生产日期 (已按时区偏移换算)
    pub offset: FixedOffset,       // 父批次日期换算使用的偏移
}

/// 规则违规描述
#[derive(Debug, Clone, PartialEq)]
pub struct RuleViolation {
    pub rule_id: String,
    pub message: String,
}

// ==========================================
// ComplianceRule Trait
// ==========================================
pub trait ComplianceRule: Send + Sync {
    /// 人类可读的规则标识 (出现在错误信息中)
    fn rule_id(&self) -> &str;

    /// 评估规则; 通过返回 None
    fn check(&self, ctx: &CompositionContext<'_>) -> Option<RuleViolation>;
}

// ==========================================
// SameDayIntermediateRule - 终混料同日使用
// ==========================================
/// 串制品批次不得使用非当日生产的终混料父批次
pub struct SameDayIntermediateRule;

impl SameDayIntermediateRule {
    pub const RULE_ID: &'static str = "HACCP-SAME-DAY-MIX";
}

impl ComplianceRule for SameDayIntermediateRule {
    fn rule_id(&self) -> &str {
        Self::RULE_ID
    }

    fn check(&self, ctx: &CompositionContext<'_>) -> Option<RuleViolation> {
        if ctx.lot_type != LotType::Skewer {
            return None;
        }

        ctx.parents
            .iter()
            .filter(|p| p.lot_type == LotType::FinalMix)
            .find_map(|parent| {
                let parent_date = parent.production_date(ctx.offset);
                (parent_date != ctx.production_date).then(|| RuleViolation {
                    rule_id: Self::RULE_ID.to_string(),
                    message: format!(
                        "串制品只能使用当日终混料: 父批次 {} 生产于 {}, 当前日期 {}",
                        parent.lot_code, parent_date, ctx.production_date
                    ),
                })
            })
    }
}

// ==========================================
// ComplianceChecker - 规则列表
// ==========================================
#[derive(Clone)]
pub struct ComplianceChecker {
    rules: Vec<Arc<dyn ComplianceRule>>,
}

impl Default for ComplianceChecker {
    /// 默认规则集
    fn default() -> Self {
        Self::empty().with_rule(Arc::new(SameDayIntermediateRule))
    }
}

impl ComplianceChecker {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// 追加规则 (评估顺序 = 追加顺序)
    pub fn with_rule(mut self, rule: Arc<dyn ComplianceRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule_id()).collect()
    }

    /// 评估全部规则,首个违规返回 ComplianceViolation
    pub fn evaluate(&self, ctx: &CompositionContext<'_>) -> EngineResult<()> {
        for rule in &self.rules {
            if let Some(violation) = rule.check(ctx) {
                warn!(
                    rule_id = %violation.rule_id,
                    lot_type = %ctx.lot_type,
                    "合规规则违反，拒绝批次登记"
                );
                return Err(EngineError::ComplianceViolation {
                    rule_id: violation.rule_id,
                    message: violation.message,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lot_on(code: &str, lot_type: LotType, y: i32, m: u32, d: u32, h: u32) -> Lot {
        Lot {
            lot_id: code.to_string(),
            lot_code: code.to_string(),
            lot_type,
            run_id: None,
            step_index: None,
            weight_kg: Some(20.0),
            temperature_c: Some(3.0),
            metadata: serde_json::json!({}),
            operator_id: None,
            created_at: Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap(),
        }
    }

    fn ctx<'a>(lot_type: LotType, parents: &'a [Lot], date: NaiveDate) -> CompositionContext<'a> {
        CompositionContext {
            lot_type,
            parents,
            production_date: date,
            offset: FixedOffset::east_opt(0).unwrap(),
        }
    }

    #[test]
    fn test_previous_day_mix_rejected_for_skewer() {
        let parents = vec![lot_on("MIX-20260118-0001", LotType::FinalMix, 2026, 1, 18, 15)];
        let today = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();

        let err = ComplianceChecker::default()
            .evaluate(&ctx(LotType::Skewer, &parents, today))
            .unwrap_err();
        match err {
            EngineError::ComplianceViolation { rule_id, message } => {
                assert_eq!(rule_id, SameDayIntermediateRule::RULE_ID);
                assert!(message.contains("MIX-20260118-0001"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_same_day_mix_accepted() {
        let parents = vec![lot_on("MIX-20260119-0001", LotType::FinalMix, 2026, 1, 19, 6)];
        let today = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
        assert!(ComplianceChecker::default()
            .evaluate(&ctx(LotType::Skewer, &parents, today))
            .is_ok());
    }

    #[test]
    fn test_rule_only_applies_to_skewer_and_final_mix() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
        let old_mix = vec![lot_on("MIX-OLD", LotType::FinalMix, 2026, 1, 10, 8)];
        let old_bulk = vec![lot_on("BULK-OLD", LotType::BulkMix, 2026, 1, 10, 8)];

        let checker = ComplianceChecker::default();
        assert!(checker.evaluate(&ctx(LotType::Frozen, &old_mix, today)).is_ok());
        assert!(checker.evaluate(&ctx(LotType::Skewer, &old_bulk, today)).is_ok());
    }

    #[test]
    fn test_offset_shifts_calendar_day() {
        // UTC 23:30 在 UTC+1 已是次日
        let parents = vec![Lot {
            created_at: Utc.with_ymd_and_hms(2026, 1, 18, 23, 30, 0).unwrap(),
            ..lot_on("MIX-LATE", LotType::FinalMix, 2026, 1, 18, 23)
        }];
        let today = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
        let shifted = CompositionContext {
            offset: FixedOffset::east_opt(3600).unwrap(),
            ..ctx(LotType::Skewer, &parents, today)
        };
        assert!(ComplianceChecker::default().evaluate(&shifted).is_ok());
        assert!(ComplianceChecker::default()
            .evaluate(&ctx(LotType::Skewer, &parents, today))
            .is_err());
    }

    struct AlwaysFail(&'static str);

    impl ComplianceRule for AlwaysFail {
        fn rule_id(&self) -> &str {
            self.0
        }
        fn check(&self, _ctx: &CompositionContext<'_>) -> Option<RuleViolation> {
            Some(RuleViolation {
                rule_id: self.0.to_string(),
                message: "always".to_string(),
            })
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl ComplianceRule for Counting {
        fn rule_id(&self) -> &str {
            "COUNTING"
        }
        fn check(&self, _ctx: &CompositionContext<'_>) -> Option<RuleViolation> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn test_first_violation_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let checker = ComplianceChecker::empty()
            .with_rule(Arc::new(Counting(calls.clone())))
            .with_rule(Arc::new(AlwaysFail("FIRST")))
            .with_rule(Arc::new(AlwaysFail("SECOND")))
            .with_rule(Arc::new(Counting(calls.clone())));
        assert_eq!(checker.rule_ids(), vec!["COUNTING", "FIRST", "SECOND", "COUNTING"]);

        let today = NaiveDate::from_ymd_opt(2026, 1, 19).unwrap();
        let err = checker.evaluate(&ctx(LotType::Raw, &[], today)).unwrap_err();
        assert!(matches!(err, EngineError::ComplianceViolation { ref rule_id, .. } if rule_id == "FIRST"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
