// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod profiles;
mod schema;

pub use loader::load;
pub use profiles::{lookup_profile, ImageInput, UpstreamProfile};
pub use schema::*;
