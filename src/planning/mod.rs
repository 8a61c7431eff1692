pub mod graph;
pub mod scheduler;
pub mod service;

pub use scheduler::{compute_schedule, Schedule, ScheduleKpis, ScheduleWarning, TaskDates};
pub use service::Planner;
