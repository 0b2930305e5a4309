// ==========================================
// 生产批次追溯引擎 - 谱系查询结果
// ==========================================

use crate::domain::lot::{GenealogyLink, Lot};
use crate::domain::types::TraversalDirection;
use serde::{Deserialize, Serialize};

/// 有界深度谱系闭包
///
/// `nodes` 含根批次本身; `links` 只包含两端都在 `nodes` 内的边
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenealogyGraph {
    pub root: Lot,
    pub direction: TraversalDirection,
    pub depth: u32,
    pub nodes: Vec<Lot>,
    pub links: Vec<GenealogyLink>,
    pub cycle_detected: bool, // 数据完整性告警
}

impl GenealogyGraph {
    pub fn contains(&self, lot_id: &str) -> bool {
        self.nodes.iter().any(|l| l.lot_id == lot_id)
    }

    pub fn has_edge(&self, parent_lot_id: &str, child_lot_id: &str) -> bool {
        self.links
            .iter()
            .any(|l| l.parent_lot_id == parent_lot_id && l.child_lot_id == child_lot_id)
    }
}

/// 按批次编码的一层追溯视图: 中心批次及其直接父/子批次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceabilityView {
    pub central: Lot,
    pub parents: Vec<Lot>,
    pub children: Vec<Lot>,
    pub links: Vec<GenealogyLink>,
}

impl TraceabilityView {
    /// 从以中心批次为根的谱系图中拆出直接父/子批次
    pub fn from_graph(graph: GenealogyGraph) -> Self {
        let root_id = graph.root.lot_id.clone();
        let links: Vec<GenealogyLink> = graph
            .links
            .into_iter()
            .filter(|l| l.parent_lot_id == root_id || l.child_lot_id == root_id)
            .collect();

        let is_parent = |lot: &Lot| {
            links
                .iter()
                .any(|l| l.child_lot_id == root_id && l.parent_lot_id == lot.lot_id)
        };
        let is_child = |lot: &Lot| {
            links
                .iter()
                .any(|l| l.parent_lot_id == root_id && l.child_lot_id == lot.lot_id)
        };
        let parents = graph.nodes.iter().filter(|n| is_parent(n)).cloned().collect();
        let children = graph.nodes.iter().filter(|n| is_child(n)).cloned().collect();

        Self {
            central: graph.root,
            parents,
            children,
            links,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::LotType;
    use chrono::Utc;

    fn lot(id: &str, lot_type: LotType) -> Lot {
        Lot {
            lot_id: id.to_string(),
            lot_code: format!("{}-CODE", id),
            lot_type,
            run_id: None,
            step_index: None,
            weight_kg: None,
            temperature_c: None,
            metadata: serde_json::json!({}),
            operator_id: None,
            created_at: Utc::now(),
        }
    }

    fn link(parent: &str, child: &str) -> GenealogyLink {
        GenealogyLink {
            link_id: format!("{}>{}", parent, child),
            parent_lot_id: parent.to_string(),
            child_lot_id: child.to_string(),
            quantity_used_kg: None,
            linked_at: Utc::now(),
        }
    }

    #[test]
    fn test_traceability_view_splits_direct_neighbours() {
        let graph = GenealogyGraph {
            root: lot("MIX", LotType::FinalMix),
            direction: TraversalDirection::Both,
            depth: 1,
            nodes: vec![
                lot("MIX", LotType::FinalMix),
                lot("DEB-A", LotType::Deboned),
                lot("DEB-B", LotType::Deboned),
                lot("SKW", LotType::Skewer),
            ],
            links: vec![link("DEB-A", "MIX"), link("DEB-B", "MIX"), link("MIX", "SKW")],
            cycle_detected: false,
        };

        let view = TraceabilityView::from_graph(graph);
        assert_eq!(view.central.lot_id, "MIX");
        let parents: Vec<&str> = view.parents.iter().map(|l| l.lot_id.as_str()).collect();
        assert_eq!(parents, vec!["DEB-A", "DEB-B"]);
        assert_eq!(view.children.len(), 1);
        assert_eq!(view.children[0].lot_id, "SKW");
        assert_eq!(view.links.len(), 3);
        // 中心批次不出现在父/子列表中
        assert!(!view.parents.iter().chain(&view.children).any(|l| l.lot_id == "MIX"));
    }
}
