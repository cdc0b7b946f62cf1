//! AVR bootloader protocol engines

pub mod avr109;
pub mod stk500v1;
pub mod stk500v2;
