//! Batches periodic updates into per-(COA, type) bundles before publishing,
//! without ever delaying non-periodic traffic (which bypasses this entirely).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use mtu_shared::model::{Coa, IecMsg, PeriodicUpdate, TypeId};
use mtu_shared::resilience::MtuReferenceAllocator;

/// Runs the aggregation loop: wakes on either a new periodic update or a
/// poll timeout, waits out the fixed aggregation window once anything has
/// arrived, then drains and republishes everything batched by `(coa, type)`.
pub async fn run(
    mut inbox: mpsc::UnboundedReceiver<PeriodicUpdate>,
    outbox: mpsc::UnboundedSender<IecMsg>,
    allocator: std::sync::Arc<MtuReferenceAllocator>,
    window: Duration,
) {
    let mut pending: HashMap<(Coa, TypeId), PeriodicUpdate> = HashMap::new();

    loop {
        let first = match tokio::time::timeout(Duration::from_millis(200), inbox.recv()).await {
            Ok(Some(update)) => update,
            Ok(None) => break,
            Err(_) => continue,
        };
        merge_into(&mut pending, first);

        tokio::time::sleep(window).await;
        while let Ok(update) = inbox.try_recv() {
            merge_into(&mut pending, update);
        }

        debug!(batches = pending.len(), "flushing periodic aggregation window");
        for (_, mut update) in pending.drain() {
            update.reference_nr = allocator.next();
            if outbox.send(IecMsg::PeriodicUpdate(update)).is_err() {
                return;
            }
        }
    }
}

fn merge_into(pending: &mut HashMap<(Coa, TypeId), PeriodicUpdate>, update: PeriodicUpdate) {
    let key = (update.coa, update.type_id);
    pending
        .entry(key)
        .and_modify(|existing| {
            existing.val_map.extend(update.val_map.clone());
            existing.ts_map.extend(update.ts_map.clone());
        })
        .or_insert(update);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(coa: Coa, ioa: u32, value: i64) -> PeriodicUpdate {
        PeriodicUpdate {
            coa,
            val_map: HashMap::from([(ioa, serde_json::json!(value))]),
            ts_map: HashMap::from([(ioa, value)]),
            type_id: TypeId::M_ME_NC_1,
            reference_nr: String::new(),
        }
    }

    #[tokio::test]
    async fn batches_updates_sharing_coa_and_type() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let allocator = std::sync::Arc::new(MtuReferenceAllocator::new());

        let handle = tokio::spawn(run(in_rx, out_tx, allocator, Duration::from_millis(10)));

        in_tx.send(update(14, 100, 1)).unwrap();
        in_tx.send(update(14, 101, 2)).unwrap();
        drop(in_tx);

        let msg = out_rx.recv().await.unwrap();
        match msg {
            IecMsg::PeriodicUpdate(u) => {
                assert_eq!(u.val_map.len(), 2);
                assert!(u.reference_nr.starts_with("MTU_"));
            }
            _ => panic!("expected a periodic update"),
        }
        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap();
    }
}
