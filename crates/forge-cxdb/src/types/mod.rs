// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

mod builders;
mod conversation;
mod provenance;

pub use builders::*;
pub use conversation::*;
pub use provenance::*;

#[cfg(test)]
mod tests;
