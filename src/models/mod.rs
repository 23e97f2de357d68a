// Domain models: wire frames, raw/history rows, query views.

mod history;
mod query;
mod raw;
mod wire;

pub use history::{DeviceHistory, UserHistory};
pub use query::{
    DeviceAverage, DeviceHistoryView, DevicePoint, HistoryBounds, SeriesKey, UserHistoryView,
    UserPoint, UserSeries, UserTotal,
};
pub use raw::{RawDeviceSample, RawUserSample};
pub use wire::{CpuUsage, GpuInfo, ProcessInfo, WireMessage};

/// Bytes per gibibyte (2^30). History/aggregate views report memory in GiB.
pub const BYTES_PER_GIB: f64 = 1_073_741_824.0;

pub fn bytes_to_gib(bytes: f64) -> f64 {
    bytes / BYTES_PER_GIB
}
