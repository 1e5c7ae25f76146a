//! Bidirectional bridge between a Sysmex XP hematology analyzer (ASTM
//! E1381 framing, E1394-97 records) and an HL7 v2.5.1 LIS, implementing
//! the IHE LAB-27 (query), LAB-28 (order download) and LAB-29 (result
//! upload) transactions.

pub mod config;
pub mod mapping;
pub mod protocol;
pub mod services;
pub mod translate;
