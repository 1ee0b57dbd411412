// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use awg_sim::{EventLog, SimulatedModule, SimulatedUploader};
use awg_uploader::device_traits::{AwgModule, ModuleKind, ModuleTraits};
use awg_uploader::playback::PlaybackCoordinator;
use awg_uploader::settings::{ChannelConfig, ChannelMap, UploaderSettings};
use awg_uploader::uploader::Uploader;

pub const WAIT: Duration = Duration::from_secs(5);

/// Simulated modules, their channels and a running uploader.
pub struct Rig {
    pub log: EventLog,
    pub modules: IndexMap<String, Arc<SimulatedModule>>,
    pub channels: ChannelMap,
    pub settings: UploaderSettings,
    pub uploader: Uploader,
}

impl Rig {
    pub fn new(configs: impl IntoIterator<Item = ChannelConfig>) -> Self {
        Self::build(configs, ModuleKind::M3202A.traits().clone())
    }

    pub fn with_module_traits(
        configs: impl IntoIterator<Item = ChannelConfig>,
        traits: ModuleTraits,
    ) -> Self {
        Self::build(configs, traits)
    }

    fn build(configs: impl IntoIterator<Item = ChannelConfig>, traits: ModuleTraits) -> Self {
        let log = EventLog::new();
        let channels = ChannelMap::new(configs).unwrap();
        let modules: IndexMap<String, Arc<SimulatedModule>> = channels
            .modules()
            .map(|name| {
                let module = SimulatedModule::with_traits(name, traits.clone(), log.clone());
                (name.to_string(), Arc::new(module))
            })
            .collect();
        let settings = UploaderSettings {
            lookup_grace_ms: 10,
            await_timeout_ms: 200,
            ..Default::default()
        };
        let native = SimulatedUploader::new(modules.values().cloned());
        let uploader =
            Uploader::start(settings.clone(), channels.clone(), Box::new(native)).unwrap();
        Rig {
            log,
            modules,
            channels,
            settings,
            uploader,
        }
    }

    pub fn module(&self, name: &str) -> &Arc<SimulatedModule> {
        &self.modules[name]
    }

    pub fn coordinator(&self) -> PlaybackCoordinator {
        let modules = self
            .modules
            .values()
            .map(|m| Arc::clone(m) as Arc<dyn AwgModule>);
        PlaybackCoordinator::new(modules, self.channels.clone(), &self.settings).unwrap()
    }
}
