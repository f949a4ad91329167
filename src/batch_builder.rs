//! Groups unassigned purchase orders into per-supplier batches (§4.5).
//!
//! Pipeline: group by supplier -> sort each group by value descending ->
//! split into windows of at most `max_pos_per_batch` -> sort the resulting
//! proposed batches across all suppliers by total value descending. This
//! module only covers that pure grouping/splitting/sorting step, so it can
//! be unit tested without a `Store`; the Upload Job Coordinator
//! (`upload.rs`) drives the store-linking, enqueue, and publish steps that
//! follow, since it also needs to interleave them with chunked progress
//! reporting.

use std::collections::BTreeMap;

use crate::model::{Money, PurchaseOrder};
use crate::store::ProposedBatch;
pub fn propose_batches(pos: Vec<PurchaseOrder>, max_pos_per_batch: usize) -> Vec<ProposedBatch> {
    let max_pos_per_batch = max_pos_per_batch.max(1);
    let mut by_supplier: BTreeMap<_, Vec<PurchaseOrder>> = BTreeMap::new();
    for po in pos {
        by_supplier.entry(po.supplier_id).or_default().push(po);
    }

    let mut proposals = Vec::new();
    for (supplier_id, mut group) in by_supplier {
        group.sort_by(|a, b| b.calculated_total_value.cmp(&a.calculated_total_value));
        for window in group.chunks(max_pos_per_batch) {
            let total_value: Money = window.iter().map(|po| po.calculated_total_value).sum();
            let action_types = window.iter().map(|po| po.action_type).collect();
            proposals.push(ProposedBatch {
                supplier_id,
                po_ids: window.iter().map(|po| po.id).collect(),
                action_types,
                total_value,
            });
        }
    }

    proposals.sort_by(|a, b| b.total_value.cmp(&a.total_value));
    proposals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn po(supplier_id: uuid::Uuid, value: rust_decimal::Decimal) -> PurchaseOrder {
        let now = Utc::now();
        PurchaseOrder {
            id: Uuid::new_v4(),
            external_id: Uuid::new_v4().to_string(),
            po_number: "PO1".into(),
            po_line: "1".into(),
            supplier_id,
            action_type: crate::model::ActionType::PushOut,
            status: crate::model::PoStatus::Pending,
            due_date: now.date_naive(),
            original_due_date: None,
            recommended_date: None,
            calculated_total_value: Money::new(value),
            batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn splits_large_supplier_group_into_windows() {
        let supplier = Uuid::new_v4();
        let pos: Vec<_> = (0..25).map(|i| po(supplier, dec!(1.00) * rust_decimal::Decimal::from(i + 1))).collect();
        let proposals = propose_batches(pos, 10);
        assert_eq!(proposals.len(), 3);
        assert!(proposals.iter().all(|p| p.po_ids.len() <= 10));
        let total: usize = proposals.iter().map(|p| p.po_ids.len()).sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn sorts_windows_within_a_supplier_by_value_descending() {
        let supplier = Uuid::new_v4();
        let pos = vec![po(supplier, dec!(10.00)), po(supplier, dec!(500.00)), po(supplier, dec!(50.00))];
        let proposals = propose_batches(pos, 10);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].total_value, Money::new(dec!(560.00)));
    }

    #[test]
    fn proposed_batches_sorted_across_suppliers_by_total_value_descending() {
        let supplier_a = Uuid::new_v4();
        let supplier_b = Uuid::new_v4();
        let pos = vec![po(supplier_a, dec!(100.00)), po(supplier_b, dec!(900.00))];
        let proposals = propose_batches(pos, 10);
        assert_eq!(proposals[0].supplier_id, supplier_b);
        assert_eq!(proposals[1].supplier_id, supplier_a);
    }

    #[test]
    fn empty_input_yields_no_proposals() {
        assert!(propose_batches(Vec::new(), 10).is_empty());
    }
}
