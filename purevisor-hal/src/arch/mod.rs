//! Architecture-specific module tree

pub mod x86_64;
