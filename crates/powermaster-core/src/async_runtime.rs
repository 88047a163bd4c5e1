// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Power Master.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use bevy_ecs::prelude::Resource;
use std::future::Future;

/// Resource that provides access to async task spawning. The worker
/// tasks (pollers, command writer, planner) live on the tokio runtime
/// that hosts the whole process.
#[derive(Resource, Clone)]
pub struct AsyncRuntime {
    handle: tokio::runtime::Handle,
}

impl AsyncRuntime {
    /// Capture the current tokio runtime. Must be called from within a
    /// runtime context.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn spawn<T>(
        &self,
        future: impl Future<Output = T> + Send + 'static,
    ) -> tokio::task::JoinHandle<T>
    where
        T: Send + 'static,
    {
        self.handle.spawn(future)
    }
}
