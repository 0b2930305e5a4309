// ==========================================
// 生产批次追溯引擎 - 缓冲区库存管理
// ==========================================
// 职责: 批次入库/出库/转移,容量与温度策略校验
// 红线: 策略违规直接拒绝并记录 warn,不做静默修正
// 红线: 库存查询必须读取最新已提交状态,不使用缓存
// ==========================================

use crate::config::EngineSettings;
use crate::db::{with_read, with_write_tx};
use crate::domain::buffer::{
    Buffer, BufferInventory, BufferInventoryEntry, BufferSummary, CAPACITY_EPSILON_KG,
};
use crate::domain::lot::Lot;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::TraceRepositories;
use crate::repository::{BufferRepository, LotRepository};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// 转移结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub lot_id: String,
    pub quantity_kg: f64,
    pub source_remaining_kg: f64, // 源条目剩余量 (全部转出为 0)
    pub target_entry: BufferInventoryEntry,
}

// ==========================================
// BufferInventoryManager - 缓冲区库存管理器
// ==========================================
pub struct BufferInventoryManager {
    repos: TraceRepositories,
    settings: EngineSettings,
}

impl BufferInventoryManager {
    pub fn new(repos: TraceRepositories, settings: EngineSettings) -> Self {
        Self { repos, settings }
    }

    // ==========================================
    // 入库
    // ==========================================

    /// 批次入库
    ///
    /// # 规则 (按顺序)
    /// 1. 缓冲区停用 → BufferPolicyViolation
    /// 2. 批次类型不在允许列表 → BufferPolicyViolation
    /// 3. 批次已在该缓冲区 → BufferPolicyViolation
    /// 4. 当前总量 + 入库量 > 容量 → BufferPolicyViolation
    /// 5. 温度超出 [temp_min, temp_max] → TemperatureOutOfRange
    pub fn place_lot(
        &self,
        buffer_id: &str,
        lot_id: &str,
        quantity_kg: f64,
        temperature_c: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<BufferInventoryEntry> {
        validate_quantity(quantity_kg)?;

        let entry = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            let buffer = load_buffer(tx, buffer_id)?;
            let lot = LotRepository::find_by_id_tx(tx, lot_id)?
                .ok_or_else(|| EngineError::not_found("Lot", lot_id))?;
            Self::place_lot_tx(tx, &buffer, &lot, quantity_kg, temperature_c, now)
        })?;

        info!(
            buffer_id = %entry.buffer_id,
            lot_id = %entry.lot_id,
            quantity_kg = entry.quantity_kg,
            "批次入库"
        );
        Ok(entry)
    }

    /// 在已开启的写事务中执行入库策略校验与写入
    pub fn place_lot_tx(
        conn: &Connection,
        buffer: &Buffer,
        lot: &Lot,
        quantity_kg: f64,
        temperature_c: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<BufferInventoryEntry> {
        if !buffer.is_active {
            return Err(policy_violation(buffer, lot, "缓冲区已停用"));
        }

        if !buffer.accepts(lot.lot_type) {
            return Err(policy_violation(
                buffer,
                lot,
                &format!("批次类型 {} 不允许进入该缓冲区", lot.lot_type),
            ));
        }

        if BufferRepository::open_entry_for_lot_tx(conn, &buffer.buffer_id, &lot.lot_id)?.is_some()
        {
            return Err(policy_violation(buffer, lot, "批次已在该缓冲区中"));
        }

        let current_kg = BufferRepository::open_total_kg_tx(conn, &buffer.buffer_id)?;
        if buffer.would_overflow(current_kg, quantity_kg) {
            return Err(policy_violation(
                buffer,
                lot,
                &format!(
                    "超出容量: 当前 {:.3}kg + 入库 {:.3}kg > 容量 {:.3}kg",
                    current_kg, quantity_kg, buffer.capacity_kg
                ),
            ));
        }

        if let Some(t) = temperature_c {
            if !buffer.temperature_in_range(t) {
                warn!(
                    buffer_id = %buffer.buffer_id,
                    lot_id = %lot.lot_id,
                    temperature_c = t,
                    "入库温度超出范围"
                );
                return Err(EngineError::TemperatureOutOfRange {
                    buffer_id: buffer.buffer_id.clone(),
                    temperature_c: t,
                    min: fmt_bound(buffer.temp_min_c),
                    max: fmt_bound(buffer.temp_max_c),
                });
            }
        }

        let entry = BufferInventoryEntry {
            entry_id: Uuid::new_v4().to_string(),
            buffer_id: buffer.buffer_id.clone(),
            lot_id: lot.lot_id.clone(),
            run_id: lot.run_id.clone(),
            quantity_kg,
            temperature_c,
            entered_at: now,
            exited_at: None,
        };
        BufferRepository::insert_entry_tx(conn, &entry)?;
        Ok(entry)
    }

    // ==========================================
    // 出库
    // ==========================================

    /// 批次出库 (幂等)
    ///
    /// # 返回
    /// - Ok(true): 已出库
    /// - Ok(false): 批次本不在该缓冲区,无操作
    /// - Err(NotFound): 缓冲区不存在
    pub fn remove_lot(&self, buffer_id: &str, lot_id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        let timeout = self.settings.storage_timeout();
        let removed = with_write_tx(&self.repos.conn, timeout, |tx| -> EngineResult<bool> {
            load_buffer(tx, buffer_id)?;
            match BufferRepository::open_entry_for_lot_tx(tx, buffer_id, lot_id)? {
                Some(entry) => Ok(BufferRepository::close_entry_tx(tx, &entry.entry_id, &now)? > 0),
                None => Ok(false),
            }
        })?;

        if removed {
            info!(buffer_id = %buffer_id, lot_id = %lot_id, "批次出库");
        }
        Ok(removed)
    }

    // ==========================================
    // 转移
    // ==========================================

    /// 在缓冲区之间转移批次
    ///
    /// # 参数
    /// - quantity_kg: 转移量; None 表示全部转出
    ///
    /// # 规则
    /// - 部分转出: 源条目扣减剩余量
    /// - 全部转出: 源条目关闭
    /// - 目标缓冲区执行完整入库策略
    pub fn transfer(
        &self,
        from_buffer_id: &str,
        to_buffer_id: &str,
        lot_id: &str,
        quantity_kg: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<TransferOutcome> {
        if from_buffer_id == to_buffer_id {
            return Err(EngineError::validation("to_buffer_id", "源缓冲区与目标缓冲区相同"));
        }
        if let Some(q) = quantity_kg {
            validate_quantity(q)?;
        }

        let outcome = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            load_buffer(tx, from_buffer_id)?;
            let target = load_buffer(tx, to_buffer_id)?;
            let lot = LotRepository::find_by_id_tx(tx, lot_id)?
                .ok_or_else(|| EngineError::not_found("Lot", lot_id))?;
            let source = BufferRepository::open_entry_for_lot_tx(tx, from_buffer_id, lot_id)?
                .ok_or_else(|| EngineError::not_found("BufferInventoryEntry", lot_id))?;

            let moved = quantity_kg.unwrap_or(source.quantity_kg);
            if moved > source.quantity_kg + CAPACITY_EPSILON_KG {
                return Err(EngineError::validation(
                    "quantity_kg",
                    format!(
                        "转移量 {:.3}kg 超过源库存 {:.3}kg",
                        moved, source.quantity_kg
                    ),
                ));
            }

            let remaining = source.quantity_kg - moved;
            if remaining <= CAPACITY_EPSILON_KG {
                BufferRepository::close_entry_tx(tx, &source.entry_id, &now)?;
            } else {
                BufferRepository::update_entry_quantity_tx(tx, &source.entry_id, remaining)?;
            }

            let target_entry =
                Self::place_lot_tx(tx, &target, &lot, moved, source.temperature_c, now)?;

            Ok(TransferOutcome {
                lot_id: lot.lot_id,
                quantity_kg: moved,
                source_remaining_kg: remaining.max(0.0),
                target_entry,
            })
        })?;

        info!(
            from = %from_buffer_id,
            to = %to_buffer_id,
            lot_id = %lot_id,
            quantity_kg = outcome.quantity_kg,
            "批次转移"
        );
        Ok(outcome)
    }

    // ==========================================
    // 查询
    // ==========================================

    /// 缓冲区当前库存 (最新已提交状态)
    pub fn inventory(&self, buffer_id: &str) -> EngineResult<BufferInventory> {
        with_read(&self.repos.conn, self.settings.storage_timeout(), |conn| {
            let buffer = load_buffer(conn, buffer_id)?;
            let entries = BufferRepository::open_entries_tx(conn, buffer_id)?;
            Ok(BufferInventory::new(buffer, entries))
        })
    }

    /// 全部缓冲区汇总
    pub fn list_buffers(&self) -> EngineResult<Vec<BufferSummary>> {
        let buffers = self.repos.buffer_repo.list_all()?;
        with_read(&self.repos.conn, self.settings.storage_timeout(), |conn| {
            buffers
                .into_iter()
                .map(|buffer| {
                    let entries = BufferRepository::open_entries_tx(conn, &buffer.buffer_id)?;
                    Ok(BufferSummary::from(&BufferInventory::new(buffer, entries)))
                })
                .collect::<EngineResult<Vec<_>>>()
        })
    }

    /// 某运行在各缓冲区的在库批次 (按缓冲区分组)
    pub fn inventories_for_run(&self, run_id: &str) -> EngineResult<Vec<BufferInventory>> {
        let entries = self.repos.buffer_repo.open_entries_for_run(run_id)?;

        let mut grouped: BTreeMap<String, Vec<BufferInventoryEntry>> = BTreeMap::new();
        for entry in entries {
            grouped.entry(entry.buffer_id.clone()).or_default().push(entry);
        }

        with_read(&self.repos.conn, self.settings.storage_timeout(), |conn| {
            grouped
                .into_iter()
                .map(|(buffer_id, entries)| {
                    let buffer = load_buffer(conn, &buffer_id)?;
                    Ok(BufferInventory::new(buffer, entries))
                })
                .collect::<EngineResult<Vec<_>>>()
        })
    }
}

// ==========================================
// 辅助函数
// ==========================================

fn load_buffer(conn: &Connection, buffer_id: &str) -> EngineResult<Buffer> {
    BufferRepository::find_by_id_tx(conn, buffer_id)?
        .ok_or_else(|| EngineError::not_found("Buffer", buffer_id))
}

fn validate_quantity(quantity_kg: f64) -> EngineResult<()> {
    if !quantity_kg.is_finite() || quantity_kg <= 0.0 {
        return Err(EngineError::validation("quantity_kg", "数量必须为正数"));
    }
    Ok(())
}

fn policy_violation(buffer: &Buffer, lot: &Lot, message: &str) -> EngineError {
    warn!(
        buffer_id = %buffer.buffer_id,
        lot_id = %lot.lot_id,
        lot_type = %lot.lot_type,
        "缓冲区策略违反: {}", message
    );
    EngineError::BufferPolicyViolation {
        buffer_id: buffer.buffer_id.clone(),
        message: message.to_string(),
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}
