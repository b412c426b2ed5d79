pub mod analyze;
pub mod design;
pub mod melt;
pub mod scan;
