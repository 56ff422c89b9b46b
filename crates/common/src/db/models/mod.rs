//! SeaORM entity models
//!
//! Only documents have an entity; chunks carry a `vector` column and are
//! read and written with raw SQL in the repository.

mod document;

pub use document::{
    Entity as DocumentEntity,
    Model as Document,
    ActiveModel as DocumentActiveModel,
};
