#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]
extern crate alloc;

pub mod arena;
pub mod config;
pub mod dma;
pub mod emulator;
pub mod error;
pub mod framebuffer;
pub mod hw;
pub mod palette;
pub mod scanline;
pub mod scheduler;
pub mod tmds;
