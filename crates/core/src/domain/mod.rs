pub mod bar;
pub mod job;
pub mod metric;
pub mod sector;
pub mod snapshot;

pub use bar::{normalize_symbol, DailyPoint, OhlcvBar};
pub use job::{JobRecord, JobStatus};
pub use metric::{MetricOutcome, TickerMetric, YtdRalph};
pub use sector::{normalize_sector_id, MemberDetail, SectorDefinition, SectorRollup, TickerLeader};
pub use snapshot::{InactiveTicker, SnapshotPayload, TickerMetricRecord};
