pub mod predict;
pub mod prepare_data;
pub mod train;
