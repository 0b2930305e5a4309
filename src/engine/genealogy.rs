// ==========================================
// 生产批次追溯引擎 - 谱系图引擎
// ==========================================
// 职责: 有界深度的上游/下游/双向谱系遍历; 人工补录谱系关系
// 复杂度: O(到达的边数),不扫描全部批次
// 红线: 遍历必须终止 (visited 集合,不重复访问节点)
// 红线: 发现环路记录 warn 并在结果中标记,不静默吞掉
// ==========================================

use crate::config::EngineSettings;
use crate::db::{with_read, with_write_tx};
use crate::domain::genealogy::GenealogyGraph;
use crate::domain::lot::{GenealogyLink, Lot};
use crate::domain::types::TraversalDirection;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::TraceRepositories;
use crate::repository::{LotRepository, RepositoryResult};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{info, warn};
use uuid::Uuid;

/// 单向查询默认深度
pub const DEFAULT_LINEAGE_DEPTH: u32 = 1;
/// 双向谱系树默认深度
pub const DEFAULT_TREE_DEPTH: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Up,   // 沿父批次
    Down, // 沿子批次
}

// ==========================================
// GenealogyEngine - 谱系图引擎
// ==========================================
pub struct GenealogyEngine {
    repos: TraceRepositories,
    settings: EngineSettings,
}

impl GenealogyEngine {
    pub fn new(repos: TraceRepositories, settings: EngineSettings) -> Self {
        Self { repos, settings }
    }

    // ==========================================
    // 查询入口
    // ==========================================

    /// 上游追溯 (父批次)
    pub fn parents(&self, lot_id: &str, depth: Option<u32>) -> EngineResult<GenealogyGraph> {
        self.traverse(
            lot_id,
            TraversalDirection::Backward,
            depth.unwrap_or(DEFAULT_LINEAGE_DEPTH),
        )
    }

    /// 下游追踪 (子批次)
    pub fn children(&self, lot_id: &str, depth: Option<u32>) -> EngineResult<GenealogyGraph> {
        self.traverse(
            lot_id,
            TraversalDirection::Forward,
            depth.unwrap_or(DEFAULT_LINEAGE_DEPTH),
        )
    }

    /// 双向谱系树
    pub fn tree(&self, lot_id: &str, depth: Option<u32>) -> EngineResult<GenealogyGraph> {
        self.traverse(
            lot_id,
            TraversalDirection::Both,
            depth.unwrap_or(DEFAULT_TREE_DEPTH),
        )
    }

    /// 有界深度遍历
    ///
    /// # 参数
    /// - lot_id: 起点批次
    /// - direction: backward / forward / both
    /// - depth: 最大跳数; 0 只返回起点
    ///
    /// # 返回
    /// - nodes: 含起点在内的全部到达批次 (按批次ID去重)
    /// - links: 连接这些批次的边 (按关系ID去重)
    pub fn traverse(
        &self,
        lot_id: &str,
        direction: TraversalDirection,
        depth: u32,
    ) -> EngineResult<GenealogyGraph> {
        let max_depth = match direction {
            TraversalDirection::Both => self.settings.genealogy_tree_max_depth,
            _ => self.settings.genealogy_max_depth,
        };
        if depth > max_depth {
            return Err(EngineError::validation(
                "depth",
                format!("深度必须在 0..={} 之间", max_depth),
            ));
        }

        let graph = with_read(&self.repos.conn, self.settings.storage_timeout(), |conn| {
            Self::traverse_tx(conn, lot_id, direction, depth)
        })?;

        if graph.cycle_detected {
            warn!(
                lot_id = %lot_id,
                direction = %direction,
                depth = depth,
                "谱系数据存在环路 (数据完整性违规)"
            );
        }
        Ok(graph)
    }

    /// 在给定连接上执行遍历
    pub fn traverse_tx(
        conn: &Connection,
        lot_id: &str,
        direction: TraversalDirection,
        depth: u32,
    ) -> EngineResult<GenealogyGraph> {
        let root = LotRepository::find_by_id_tx(conn, lot_id)?
            .ok_or_else(|| EngineError::not_found("Lot", lot_id))?;

        let mut nodes: Vec<Lot> = vec![root.clone()];
        let mut seen_nodes: HashSet<String> = HashSet::from([root.lot_id.clone()]);
        let mut links: Vec<GenealogyLink> = Vec::new();
        let mut seen_links: HashSet<String> = HashSet::new();

        let walks: &[Walk] = match direction {
            TraversalDirection::Backward => &[Walk::Up],
            TraversalDirection::Forward => &[Walk::Down],
            TraversalDirection::Both => &[Walk::Up, Walk::Down],
        };

        for walk in walks {
            let mut visited: HashSet<String> = HashSet::from([root.lot_id.clone()]);
            let mut queue: VecDeque<(String, u32)> = VecDeque::from([(root.lot_id.clone(), 0)]);

            while let Some((current, level)) = queue.pop_front() {
                if level >= depth {
                    continue;
                }

                for link in Self::neighbour_links(conn, &current, *walk)? {
                    let next = match walk {
                        Walk::Up => link.parent_lot_id.clone(),
                        Walk::Down => link.child_lot_id.clone(),
                    };

                    if visited.insert(next.clone()) {
                        queue.push_back((next.clone(), level + 1));
                    }
                    if seen_nodes.insert(next.clone()) {
                        // 外键保证存在; 缺失即跳过该点,不中断遍历
                        if let Some(lot) = LotRepository::find_by_id_tx(conn, &next)? {
                            nodes.push(lot);
                        }
                    }
                    if seen_links.insert(link.link_id.clone()) {
                        links.push(link);
                    }
                }
            }
        }

        let node_ids: HashSet<&str> = nodes.iter().map(|n| n.lot_id.as_str()).collect();
        links.retain(|l| {
            node_ids.contains(l.parent_lot_id.as_str()) && node_ids.contains(l.child_lot_id.as_str())
        });
        let cycle_detected = has_cycle(&links);

        Ok(GenealogyGraph {
            root,
            direction,
            depth,
            nodes,
            links,
            cycle_detected,
        })
    }

    fn neighbour_links(
        conn: &Connection,
        lot_id: &str,
        walk: Walk,
    ) -> RepositoryResult<Vec<GenealogyLink>> {
        match walk {
            Walk::Up => LotRepository::links_to_child_tx(conn, lot_id),
            Walk::Down => LotRepository::links_from_parent_tx(conn, lot_id),
        }
    }

    // ==========================================
    // 谱系补录
    // ==========================================

    /// 追加一条父 → 子谱系关系
    ///
    /// # 规则
    /// - 不允许自环
    /// - 父子批次都必须存在
    /// - 关系已存在 → Validation
    /// - 子批次已是父批次的祖先 (将形成环) → Validation
    pub fn link(
        &self,
        parent_lot_id: &str,
        child_lot_id: &str,
        quantity_used_kg: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<GenealogyLink> {
        if parent_lot_id == child_lot_id {
            return Err(EngineError::validation("child_lot_id", "批次不能成为自身的父批次"));
        }
        if let Some(q) = quantity_used_kg {
            if !q.is_finite() || q < 0.0 {
                return Err(EngineError::validation("quantity_used_kg", "消耗量不能为负数"));
            }
        }

        let link = with_write_tx(&self.repos.conn, self.settings.storage_timeout(), |tx| {
            if LotRepository::find_by_id_tx(tx, parent_lot_id)?.is_none() {
                return Err(EngineError::not_found("Lot", parent_lot_id));
            }
            if LotRepository::find_by_id_tx(tx, child_lot_id)?.is_none() {
                return Err(EngineError::not_found("Lot", child_lot_id));
            }
            if LotRepository::links_to_child_tx(tx, child_lot_id)?
                .iter()
                .any(|l| l.parent_lot_id == parent_lot_id)
            {
                return Err(EngineError::validation("parent_lot_id", "谱系关系已存在"));
            }
            if Self::is_descendant_tx(tx, child_lot_id, parent_lot_id)? {
                warn!(
                    parent_lot_id = %parent_lot_id,
                    child_lot_id = %child_lot_id,
                    "拒绝形成环路的谱系关系"
                );
                return Err(EngineError::validation(
                    "child_lot_id",
                    "该关系将形成环路: 子批次已是父批次的祖先",
                ));
            }

            let link = GenealogyLink {
                link_id: Uuid::new_v4().to_string(),
                parent_lot_id: parent_lot_id.to_string(),
                child_lot_id: child_lot_id.to_string(),
                quantity_used_kg,
                linked_at: now,
            };
            LotRepository::insert_link_tx(tx, &link)?;
            Ok(link)
        })?;

        info!(
            parent_lot_id = %link.parent_lot_id,
            child_lot_id = %link.child_lot_id,
            "谱系关系已补录"
        );
        Ok(link)
    }

    /// `target` 是否可从 `from` 沿子批次方向到达
    fn is_descendant_tx(conn: &Connection, from: &str, target: &str) -> EngineResult<bool> {
        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut queue: VecDeque<String> = VecDeque::from([from.to_string()]);

        while let Some(current) = queue.pop_front() {
            for link in LotRepository::links_from_parent_tx(conn, &current)? {
                if link.child_lot_id == target {
                    return Ok(true);
                }
                if visited.insert(link.child_lot_id.clone()) {
                    queue.push_back(link.child_lot_id);
                }
            }
        }
        Ok(false)
    }
}

/// 有向图环检测 (三色 DFS,迭代实现)
///
/// 汇聚 (菱形) 结构不是环
fn has_cycle(links: &[GenealogyLink]) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for link in links {
        adjacency
            .entry(link.parent_lot_id.as_str())
            .or_default()
            .push(link.child_lot_id.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let starts: Vec<&str> = adjacency.keys().copied().collect();

    for start in starts {
        if marks.contains_key(start) {
            continue;
        }
        // (节点, 下一个待访问邻居下标)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::InProgress);

        while let Some((node, idx)) = stack.last_mut() {
            let next = adjacency.get(*node).and_then(|n| n.get(*idx)).copied();
            *idx += 1;
            match next {
                Some(child) => match marks.get(child) {
                    Some(Mark::InProgress) => return true,
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::InProgress);
                        stack.push((child, 0));
                    }
                },
                None => {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }
    }
    false
}
