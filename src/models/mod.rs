pub mod audit;
pub mod recipient;
pub mod voucher;
