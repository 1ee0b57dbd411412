// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::Samples;
use crate::device_traits::AwgModule;
use crate::settings::ChannelMap;

/// A hardware-resident program that starts and loops the modules in sync.
pub trait TriggerProgram: Send + Sync {
    /// Prepare the program for a sequence of `duration` samples played `repeat_count` times.
    fn compile(&self, duration: Samples, repeat_count: u32) -> anyhow::Result<()>;

    fn load(&self) -> anyhow::Result<()>;

    fn start(&self) -> anyhow::Result<()>;
}

/// Hardware made available to a custom start function.
pub struct StartContext<'a> {
    pub modules: &'a IndexMap<String, Arc<dyn AwgModule>>,
    pub channels: &'a ChannelMap,
}

pub type StartFunction =
    Arc<dyn Fn(&dyn TriggerProgram, &StartContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Trigger program attached to an upload job.
#[derive(Clone)]
pub struct TriggerBinding {
    program: Arc<dyn TriggerProgram>,
    start_function: Option<StartFunction>,
}

impl TriggerBinding {
    pub fn new(program: Arc<dyn TriggerProgram>) -> Self {
        TriggerBinding {
            program,
            start_function: None,
        }
    }

    /// Replace the default load + start with a custom function.
    pub fn with_start_function<F>(mut self, start: F) -> Self
    where
        F: Fn(&dyn TriggerProgram, &StartContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.start_function = Some(Arc::new(start));
        self
    }

    pub fn program(&self) -> &Arc<dyn TriggerProgram> {
        &self.program
    }

    pub fn compile(&self, duration: Samples, repeat_count: u32) -> anyhow::Result<()> {
        self.program.compile(duration, repeat_count)
    }

    pub fn start(&self, context: &StartContext<'_>) -> anyhow::Result<()> {
        match &self.start_function {
            Some(start) => start(self.program.as_ref(), context),
            None => {
                self.program.load()?;
                self.program.start()
            }
        }
    }
}

impl fmt::Debug for TriggerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBinding")
            .field("custom_start", &self.start_function.is_some())
            .finish()
    }
}
