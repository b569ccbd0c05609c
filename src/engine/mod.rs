// Book state shared by the generator and every feed
pub mod book;
pub mod registry;
pub mod types;
