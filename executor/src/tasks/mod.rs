//! Tareas que trae el executor de fábrica.

pub mod sleep;
pub mod sql_plan;
