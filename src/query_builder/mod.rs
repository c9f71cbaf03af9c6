//! Builders which compose the SQL used by the models.

pub mod sql_builder;
