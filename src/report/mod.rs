pub mod handler;

pub use handler::ReportHandler;
