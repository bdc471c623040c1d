pub mod commit;
pub mod schema;
