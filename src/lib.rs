#![allow(
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::match_same_arms,
    clippy::large_enum_variant
)]

pub mod config;
pub mod protocol;
pub mod proxy;
pub mod sql;
pub mod upstream;
