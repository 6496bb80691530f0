//! Parsers for the two dependency artifacts compilers produce: Make-style
//! `.d` files and structured unit manifests.

pub mod makefile;
pub mod manifest;
