#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod block;
pub mod card;
pub mod common;
pub mod constants;
pub mod core;
pub mod dma;
pub mod host;
pub mod osa;
pub mod queue;
pub mod regs;

pub use common::err::{MmcError, MmcResult};
