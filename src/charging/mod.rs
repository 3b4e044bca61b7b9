pub mod longrun;
pub mod oneshot;
pub mod storage;

use rust_decimal::Decimal;

use crate::store::Job;

fn usage_i64(job: &Job, key: &str) -> Result<i64, anyhow::Error> {
    job.usage_params
        .get(key)
        .and_then(|value| value.as_i64())
        .ok_or_else(|| anyhow::anyhow!("job {} usage_params missing integer field {key}", job.id))
}

fn usage_instance_type(job: &Job) -> Option<String> {
    job.usage_params.get("instance_type").and_then(|value| value.as_str()).map(str::to_string)
}

/// A charge amount split across the two debit sources available before
/// settlement (§4.4 step 5, reused verbatim by the longrun engine).
struct Split {
    from_rsv: Decimal,
    from_proj: Decimal,
    leftover: Decimal,
}

fn split_charge(total: Decimal, remaining_reservation: Decimal) -> Split {
    let from_rsv = total.min(remaining_reservation);
    let from_proj = (total - from_rsv).max(Decimal::ZERO);
    let leftover = remaining_reservation - from_rsv;
    Split { from_rsv, from_proj, leftover }
}
