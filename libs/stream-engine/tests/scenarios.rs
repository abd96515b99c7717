use serde::Deserialize;

use stream_api::{
    Computation, ComputationContext, ComputationError, ComputationMetadata, FailureKind, Record,
    RecordFlags, Watermark,
};
use stream_engine::ComputationContextImpl;

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    amount: u64,
}

/// Emits a status record per order and writes the accepted batch on timer.
#[derive(Default)]
struct OrderStatus {
    accepted: Vec<Order>,
    rejected: usize,
}

impl Computation for OrderStatus {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::new("ORDERS", vec!["orders".into()], vec!["status".into(), "batches".into()])
    }

    fn init(&mut self, _ctx: &mut dyn ComputationContext) -> Result<(), ComputationError> {
        Ok(())
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _input: &str,
        record: &Record,
    ) -> Result<(), ComputationError> {
        match serde_json::from_slice::<Order>(record.data()) {
            Ok(order) => {
                let status = Record::new(order.id.clone(), "accepted", Watermark::of_value(record.watermark()), RecordFlags::DEFAULT);
                ctx.produce_record("status", status)?;
                self.accepted.push(order);
            }
            Err(e) => {
                let status = Record::new(record.key(), format!("rejected: {e}"), Watermark::of_value(record.watermark()), RecordFlags::POISON_PILL);
                ctx.produce_record("status", status)?;
                self.rejected += 1;
            }
        }
        Ok(())
    }

    fn process_timer(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _key: &str,
        _time_ms: i64,
    ) -> Result<(), ComputationError> {
        if self.rejected > 0 {
            return Err(ComputationError::fatal(format!("{} rejected orders in the batch", self.rejected)));
        }
        let total: u64 = self.accepted.iter().map(|o| o.amount).sum();
        ctx.produce_record("batches", Record::of("batch", total.to_string()))?;
        self.accepted.clear();
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

fn run(payload: &str) -> (OrderStatus, ComputationContextImpl) {
    let mut computation = OrderStatus::default();
    let mut ctx = ComputationContextImpl::new(computation.metadata());
    computation.init(&mut ctx).unwrap();
    let record = Record::new("order-1", payload, Watermark::of_timestamp(1_000, 0), RecordFlags::DEFAULT);
    computation.process_record(&mut ctx, "orders", &record).unwrap();
    (computation, ctx)
}

#[test]
fn malformed_input_yields_one_status_and_a_fatal_flush() {
    let (mut computation, mut ctx) = run(r#"{"id": "order-1", "amount": "twelve"}"#);

    let status = ctx.get_records("status");
    assert_eq!(status.len(), 1);
    assert!(status[0].has_flag(RecordFlags::POISON_PILL));
    assert_eq!(status[0].key(), "order-1");
    assert!(!ctx.require_checkpoint());

    let err = computation.process_timer(&mut ctx, "flush", 2_000).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Fatal);
    assert!(!ctx.require_checkpoint());
    assert!(ctx.get_records("batches").is_empty());
}

#[test]
fn valid_input_yields_one_status_and_a_checkpointed_flush() {
    let (mut computation, mut ctx) = run(r#"{"id": "order-1", "amount": 12}"#);

    let status = ctx.get_records("status");
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].data(), b"accepted");
    assert!(!ctx.require_checkpoint());

    computation.process_timer(&mut ctx, "flush", 2_000).unwrap();
    assert!(ctx.require_checkpoint());
    assert!(!ctx.require_terminate());
    assert_eq!(ctx.get_records("batches")[0].data(), b"12");
}
