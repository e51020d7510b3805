/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The guest filesystem view: bindings and path translation.

pub mod binding;
pub mod flags;
pub mod translate;

pub use binding::Binding;
pub use binding::BindingTable;
pub use binding::Provider;
pub use translate::normalize;
pub use translate::Follow;
pub use translate::FsView;
pub use translate::Translated;
pub use translate::MAXSYMLINKS;
pub use translate::PATH_MAX;
