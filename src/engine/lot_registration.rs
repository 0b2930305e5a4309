// ==========================================
// 生产批次追溯引擎 - 批次登记服务
// ==========================================
// 职责: 校验并登记批次,连同全部父批次谱系关系一次性写入
// 红线: 合规规则违反 → 整体拒绝,不做部分写入
// 红线: 批次编码全局唯一
// ==========================================

use crate::config::EngineSettings;
use crate::db::with_write_tx;
use crate::domain::lot::{GenealogyLink, Lot, LotRegistration};
use crate::engine::codes::{lot_code_prefix, next_sequence, with_sequence};
use crate::engine::compliance::{ComplianceChecker, CompositionContext};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::TraceRepositories;
use crate::repository::{FlowRepository, LotRepository, RunRepository};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

/// 批次重量上限 (kg)
pub const MAX_LOT_WEIGHT_KG: f64 = 10_000.0;
/// 批次温度范围 (°C)
pub const LOT_TEMPERATURE_RANGE: (f64, f64) = (-50.0, 100.0);
/// 批次编码最大长度
pub const MAX_LOT_CODE_LEN: usize = 64;

/// 登记结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredLot {
    pub lot: Lot,
    pub links: Vec<GenealogyLink>,
}

// ==========================================
// LotRegistrationService - 批次登记服务
// ==========================================
pub struct LotRegistrationService {
    repos: TraceRepositories,
    settings: EngineSettings,
    checker: ComplianceChecker,
}

impl LotRegistrationService {
    pub fn new(repos: TraceRepositories, settings: EngineSettings) -> Self {
        Self {
            repos,
            settings,
            checker: ComplianceChecker::default(),
        }
    }

    /// 替换合规规则集
    pub fn with_checker(mut self, checker: ComplianceChecker) -> Self {
        self.checker = checker;
        self
    }

    /// 登记批次
    ///
    /// # 参数
    /// - input: 登记请求
    /// - operator_id: 登记人
    /// - now: 登记时间 (同时决定生产日期)
    ///
    /// # 返回
    /// - Ok(RegisteredLot): 新批次与其父批次关系
    /// - Err(Validation): 字段非法、编码重复、父批次重复
    /// - Err(NotFound): 运行或父批次不存在
    /// - Err(ComplianceViolation): 合规规则拒绝
    pub fn register(
        &self,
        input: LotRegistration,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<RegisteredLot> {
        self.validate_fields(&input)?;

        let offset = self.settings.compliance_offset();
        let production_date = now.with_timezone(&offset).date_naive();
        let explicit_code = input
            .lot_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let registered = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            if let Some(code) = &explicit_code {
                if LotRepository::find_by_code_tx(tx, code)?.is_some() {
                    return Err(EngineError::validation(
                        "lot_code",
                        format!("批次编码已存在: {}", code),
                    ));
                }
            }

            if let Some(run_id) = input.run_id.as_deref() {
                let run = RunRepository::find_by_id_tx(tx, run_id)?
                    .ok_or_else(|| EngineError::not_found("ProductionRun", run_id))?;
                if let Some(step_index) = input.step_index {
                    let flow = FlowRepository::find_by_id_tx(tx, &run.flow_version_id)?
                        .ok_or_else(|| EngineError::not_found("FlowVersion", &run.flow_version_id))?;
                    if flow.step(step_index).is_none() {
                        return Err(EngineError::validation(
                            "step_index",
                            format!(
                                "工序序号 {} 超出流程范围 0..={}",
                                step_index,
                                flow.final_step_index().unwrap_or(0)
                            ),
                        ));
                    }
                }
            }

            let mut parents = Vec::with_capacity(input.parents.len());
            for decl in &input.parents {
                let parent = LotRepository::find_by_id_tx(tx, &decl.lot_id)?
                    .ok_or_else(|| EngineError::not_found("Lot", &decl.lot_id))?;
                parents.push(parent);
            }

            self.checker.evaluate(&CompositionContext {
                lot_type: input.lot_type,
                parents: &parents,
                production_date,
                offset,
            })?;

            let lot_code = match &explicit_code {
                Some(code) => code.clone(),
                None => {
                    let prefix = lot_code_prefix(production_date, input.lot_type);
                    let next = next_sequence(&prefix, LotRepository::max_code_sequence_tx(tx, &prefix)?)?;
                    with_sequence(&prefix, next)
                }
            };

            let lot = Lot {
                lot_id: Uuid::new_v4().to_string(),
                lot_code,
                lot_type: input.lot_type,
                run_id: input.run_id.clone(),
                step_index: input.step_index,
                weight_kg: input.weight_kg,
                temperature_c: input.temperature_c,
                metadata: input
                    .metadata
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
                operator_id: Some(operator_id.to_string()),
                created_at: now,
            };
            LotRepository::insert_tx(tx, &lot)?;

            let mut links = Vec::with_capacity(input.parents.len());
            for decl in &input.parents {
                let link = GenealogyLink {
                    link_id: Uuid::new_v4().to_string(),
                    parent_lot_id: decl.lot_id.clone(),
                    child_lot_id: lot.lot_id.clone(),
                    quantity_used_kg: decl.quantity_used_kg,
                    linked_at: now,
                };
                LotRepository::insert_link_tx(tx, &link)?;
                links.push(link);
            }

            Ok(RegisteredLot { lot, links })
        })?;

        info!(
            lot_id = %registered.lot.lot_id,
            lot_code = %registered.lot.lot_code,
            lot_type = %registered.lot.lot_type,
            parents = registered.links.len(),
            operator_id = %operator_id,
            "批次已登记"
        );
        Ok(registered)
    }

    fn validate_fields(&self, input: &LotRegistration) -> EngineResult<()> {
        if let Some(code) = input.lot_code.as_deref().map(str::trim) {
            if code.chars().count() > MAX_LOT_CODE_LEN {
                return Err(EngineError::validation(
                    "lot_code",
                    format!("批次编码不能超过 {} 个字符", MAX_LOT_CODE_LEN),
                ));
            }
        }
        if let Some(w) = input.weight_kg {
            if !w.is_finite() || !(0.0..=MAX_LOT_WEIGHT_KG).contains(&w) {
                return Err(EngineError::validation(
                    "weight_kg",
                    format!("重量必须在 [0, {}] kg 之间", MAX_LOT_WEIGHT_KG),
                ));
            }
        }
        if let Some(t) = input.temperature_c {
            let (min, max) = LOT_TEMPERATURE_RANGE;
            if !t.is_finite() || t < min || t > max {
                return Err(EngineError::validation(
                    "temperature_c",
                    format!("温度必须在 [{}, {}] °C 之间", min, max),
                ));
            }
        }
        if input.step_index.is_some() && input.run_id.is_none() {
            return Err(EngineError::validation("step_index", "指定工序时必须指定运行"));
        }
        if let Some(idx) = input.step_index {
            if idx < 0 {
                return Err(EngineError::validation("step_index", "工序序号不能为负数"));
            }
        }

        let mut seen = HashSet::new();
        for decl in &input.parents {
            if !seen.insert(decl.lot_id.as_str()) {
                return Err(EngineError::validation(
                    "parents",
                    format!("父批次重复声明: {}", decl.lot_id),
                ));
            }
            if let Some(q) = decl.quantity_used_kg {
                if !q.is_finite() || q < 0.0 {
                    return Err(EngineError::validation("quantity_used_kg", "消耗量不能为负数"));
                }
            }
        }
        Ok(())
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get(&self, lot_id: &str) -> EngineResult<Lot> {
        self.repos
            .lot_repo
            .find_by_id(lot_id)?
            .ok_or_else(|| EngineError::not_found("Lot", lot_id))
    }

    pub fn find_by_code(&self, lot_code: &str) -> EngineResult<Option<Lot>> {
        Ok(self.repos.lot_repo.find_by_code(lot_code)?)
    }

    /// 最近登记的批次
    pub fn list(&self, limit: usize) -> EngineResult<Vec<Lot>> {
        Ok(self.repos.lot_repo.list_recent(limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_shared;
    use crate::domain::lot::ParentDeclaration;
    use crate::domain::types::LotType;
    use chrono::TimeZone;
    use std::time::Duration;

    fn service() -> LotRegistrationService {
        let conn = open_in_memory_shared().unwrap();
        let repos = TraceRepositories::new(conn, Duration::from_secs(1));
        LotRegistrationService::new(repos, EngineSettings::default())
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, h, 0, 0).unwrap()
    }

    fn with_parent(lot_type: LotType, parent: &str) -> LotRegistration {
        LotRegistration {
            parents: vec![ParentDeclaration {
                lot_id: parent.to_string(),
                quantity_used_kg: Some(12.5),
            }],
            ..LotRegistration::new(lot_type)
        }
    }

    #[test]
    fn test_generated_codes_increment_per_day_and_type() {
        let svc = service();
        let a = svc.register(LotRegistration::new(LotType::Raw), "op-1", at(19, 6)).unwrap();
        let b = svc.register(LotRegistration::new(LotType::Raw), "op-1", at(19, 7)).unwrap();
        let c = svc.register(LotRegistration::new(LotType::Deboned), "op-1", at(19, 7)).unwrap();
        assert_eq!(a.lot.lot_code, "RAW-20260119-0001");
        assert_eq!(b.lot.lot_code, "RAW-20260119-0002");
        assert_eq!(c.lot.lot_code, "DEB-20260119-0001");
    }

    #[test]
    fn test_manual_code_with_huge_suffix_does_not_break_numbering() {
        let svc = service();
        let manual = LotRegistration {
            lot_code: Some("RAW-20260119-4294967295".to_string()),
            ..LotRegistration::new(LotType::Raw)
        };
        svc.register(manual, "op-1", at(19, 6)).unwrap();

        let auto = svc.register(LotRegistration::new(LotType::Raw), "op-1", at(19, 7)).unwrap();
        assert_eq!(auto.lot.lot_code, "RAW-20260119-0001");

        let next = svc.register(LotRegistration::new(LotType::Raw), "op-1", at(19, 8)).unwrap();
        assert_eq!(next.lot.lot_code, "RAW-20260119-0002");
        assert_eq!(svc.list(10).unwrap().len(), 3);
    }

    #[test]
    fn test_skewer_from_previous_day_mix_rejected_atomically() {
        let svc = service();
        let mix = svc.register(LotRegistration::new(LotType::FinalMix), "op-1", at(18, 15)).unwrap();

        let err = svc
            .register(with_parent(LotType::Skewer, &mix.lot.lot_id), "op-1", at(19, 8))
            .unwrap_err();
        assert!(matches!(err, EngineError::ComplianceViolation { .. }));
        // 未写入任何批次
        assert_eq!(svc.list(10).unwrap().len(), 1);
    }

    #[test]
    fn test_skewer_from_same_day_mix_links_parent() {
        let svc = service();
        let mix = svc.register(LotRegistration::new(LotType::FinalMix), "op-1", at(19, 6)).unwrap();
        let skewer = svc
            .register(with_parent(LotType::Skewer, &mix.lot.lot_id), "op-1", at(19, 9))
            .unwrap();
        assert_eq!(skewer.links.len(), 1);
        assert_eq!(skewer.links[0].parent_lot_id, mix.lot.lot_id);
        assert_eq!(skewer.links[0].quantity_used_kg, Some(12.5));
    }

    #[test]
    fn test_field_validation() {
        let svc = service();
        let heavy = LotRegistration {
            weight_kg: Some(10_000.5),
            ..LotRegistration::new(LotType::Raw)
        };
        assert!(svc.register(heavy, "op-1", at(19, 6)).is_err());

        let exact = LotRegistration {
            weight_kg: Some(10_000.0),
            temperature_c: Some(-50.0),
            ..LotRegistration::new(LotType::Raw)
        };
        assert!(svc.register(exact, "op-1", at(19, 6)).is_ok());

        let dup_parents = LotRegistration {
            parents: vec![
                ParentDeclaration { lot_id: "P".into(), quantity_used_kg: None },
                ParentDeclaration { lot_id: "P".into(), quantity_used_kg: None },
            ],
            ..LotRegistration::new(LotType::Deboned)
        };
        assert!(matches!(
            svc.register(dup_parents, "op-1", at(19, 6)),
            Err(EngineError::Validation { ref field, .. }) if field == "parents"
        ));
    }

    #[test]
    fn test_duplicate_code_and_unknown_parent() {
        let svc = service();
        let coded = LotRegistration {
            lot_code: Some("RAW-MANUAL-1".to_string()),
            ..LotRegistration::new(LotType::Raw)
        };
        svc.register(coded.clone(), "op-1", at(19, 6)).unwrap();
        assert!(matches!(
            svc.register(coded, "op-1", at(19, 7)),
            Err(EngineError::Validation { ref field, .. }) if field == "lot_code"
        ));

        assert!(matches!(
            svc.register(with_parent(LotType::Deboned, "missing"), "op-1", at(19, 6)),
            Err(EngineError::NotFound { .. })
        ));
        assert!(svc.find_by_code("RAW-MANUAL-1").unwrap().is_some());
    }

    #[test]
    fn test_unknown_run_rejected() {
        let svc = service();
        let input = LotRegistration {
            run_id: Some("no-such-run".to_string()),
            step_index: Some(1),
            ..LotRegistration::new(LotType::Raw)
        };
        assert!(matches!(
            svc.register(input, "op-1", at(19, 6)),
            Err(EngineError::NotFound { .. })
        ));
    }
}
