// ==========================================
// 缓冲区库存集成测试
// ==========================================
// 职责: 验证容量边界、批次类型、温度范围与转移
// ==========================================


#[cfg(test)]
mod buffer_inventory_test {
    use chrono::Utc;
    use haccp_trace::config::EngineSettings;
    use haccp_trace::domain::types::LotType;
    use haccp_trace::engine::{BufferInventoryManager, EngineError, LotRegistrationService};

    use crate::test_helpers::{register_lot, setup_repos};

    const MIX_BUFFER: &str = "MIX-001";
    const COLD_ROOM: &str = "LK-001";

    fn setup() -> (tempfile::NamedTempFile, BufferInventoryManager, LotRegistrationService) {
        let (tmp, _conn, repos) = setup_repos();
        let settings = EngineSettings::default();
        (
            tmp,
            BufferInventoryManager::new(repos.clone(), settings.clone()),
            LotRegistrationService::new(repos, settings),
        )
    }

    #[test]
    fn test_capacity_exactly_full_then_overflow() {
        let (_tmp, buffers, lots) = setup();
        let first = register_lot(&lots, LotType::FinalMix, &[], Utc::now());
        let second = register_lot(&lots, LotType::FinalMix, &[], Utc::now());

        buffers
            .place_lot(MIX_BUFFER, &first.lot_id, 500.0, Some(3.0), Utc::now())
            .unwrap();

        let inv = buffers.inventory(MIX_BUFFER).unwrap();
        assert_eq!(inv.item_count, 1);
        assert!((inv.total_quantity_kg - 500.0).abs() < 1e-9);
        assert!(inv.remaining_capacity_kg().abs() < 1e-9);

        let err = buffers
            .place_lot(MIX_BUFFER, &second.lot_id, 1.0, Some(3.0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::BufferPolicyViolation { .. }));
        assert_eq!(buffers.inventory(MIX_BUFFER).unwrap().item_count, 1);
    }

    #[test]
    fn test_wrong_lot_type_and_temperature() {
        let (_tmp, buffers, lots) = setup();
        let raw = register_lot(&lots, LotType::Raw, &[], Utc::now());
        let mix = register_lot(&lots, LotType::FinalMix, &[], Utc::now());

        assert!(matches!(
            buffers.place_lot(MIX_BUFFER, &raw.lot_id, 10.0, Some(3.0), Utc::now()),
            Err(EngineError::BufferPolicyViolation { .. })
        ));
        assert!(matches!(
            buffers.place_lot(MIX_BUFFER, &mix.lot_id, 10.0, Some(6.5), Utc::now()),
            Err(EngineError::TemperatureOutOfRange { .. })
        ));
        assert!(matches!(
            buffers.place_lot("NO-SUCH", &mix.lot_id, 10.0, None, Utc::now()),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_placement_rejected_and_remove() {
        let (_tmp, buffers, lots) = setup();
        let deb = register_lot(&lots, LotType::Deboned, &[], Utc::now());

        buffers
            .place_lot(COLD_ROOM, &deb.lot_id, 100.0, Some(2.0), Utc::now())
            .unwrap();
        assert!(matches!(
            buffers.place_lot(COLD_ROOM, &deb.lot_id, 10.0, Some(2.0), Utc::now()),
            Err(EngineError::BufferPolicyViolation { .. })
        ));

        assert!(buffers.remove_lot(COLD_ROOM, &deb.lot_id, Utc::now()).unwrap());
        assert!(!buffers.remove_lot(COLD_ROOM, &deb.lot_id, Utc::now()).unwrap());
        assert_eq!(buffers.inventory(COLD_ROOM).unwrap().item_count, 0);
    }

    #[test]
    fn test_partial_transfer_applies_target_policy() {
        let (_tmp, buffers, lots) = setup();
        let bulk = register_lot(&lots, LotType::BulkMix, &[], Utc::now());
        let mix = register_lot(&lots, LotType::FinalMix, &[], Utc::now());

        // 目标缓冲区不接受 BULK → 整体回滚
        buffers
            .place_lot(COLD_ROOM, &bulk.lot_id, 80.0, Some(2.0), Utc::now())
            .unwrap();
        assert!(buffers
            .transfer(COLD_ROOM, MIX_BUFFER, &bulk.lot_id, Some(30.0), Utc::now())
            .is_err());
        let inv = buffers.inventory(COLD_ROOM).unwrap();
        assert!((inv.total_quantity_kg - 80.0).abs() < 1e-9);

        buffers
            .place_lot(MIX_BUFFER, &mix.lot_id, 40.0, Some(3.0), Utc::now())
            .unwrap();
        assert!(matches!(
            buffers.transfer(MIX_BUFFER, MIX_BUFFER, &mix.lot_id, None, Utc::now()),
            Err(EngineError::Validation { .. })
        ));

        let summaries = buffers.list_buffers().unwrap();
        assert_eq!(summaries.len(), 5);
        let mix_summary = summaries
            .iter()
            .find(|s| s.buffer.buffer_id == MIX_BUFFER)
            .unwrap();
        assert!((mix_summary.utilization_pct - 8.0).abs() < 1e-9);
    }
}
