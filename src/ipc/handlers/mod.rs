pub mod accounts;
pub mod branches;
pub mod classes;
pub mod communications;
pub mod core;
pub mod delivery;
pub mod positions;
pub mod recipients;
