// Tests module
// Scenarios: end-to-end ban escalation, whitelist and diversity behaviour
// Properties: score bounds and decay invariants under arbitrary event streams
// Concurrency: parallel event recording and admission
// Persistence: RocksDB round-trips, writer drain and degraded storage

pub mod properties;
pub mod concurrency;
