pub mod image;
pub mod repository;

pub use image::ImageBuilder;
pub use repository::RepositoryBuilder;
