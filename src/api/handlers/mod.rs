pub mod capture;
pub mod lookup;
