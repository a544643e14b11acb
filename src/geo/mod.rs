pub mod coordinate;
pub mod dns;
