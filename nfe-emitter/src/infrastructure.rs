pub mod logging;
pub mod pem_utils;
