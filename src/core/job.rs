use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::settings::{SettingValue, Settings};

/// The six images the fast trainer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InputName {
    Image,
    Background,
    MusicLayer,
    StaffLayer,
    Text,
    SelectedRegions,
}

impl InputName {
    pub const ALL: [InputName; 6] = [
        InputName::Image,
        InputName::Background,
        InputName::MusicLayer,
        InputName::StaffLayer,
        InputName::Text,
        InputName::SelectedRegions,
    ];

    /// Key used in the request envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            InputName::Image => "Image",
            InputName::Background => "Background",
            InputName::MusicLayer => "Music Layer",
            InputName::StaffLayer => "Staff Layer",
            InputName::Text => "Text",
            InputName::SelectedRegions => "Selected Regions",
        }
    }

    /// Name of the workflow input port the file arrives on.
    pub fn port_name(&self) -> &'static str {
        match self {
            InputName::Image => "Image",
            InputName::Background => "rgba PNG - Background layer",
            InputName::MusicLayer => "rgba PNG - Music symbol layer",
            InputName::StaffLayer => "rgba PNG - Staff lines layer",
            InputName::Text => "rgba PNG - Text",
            InputName::SelectedRegions => "rgba PNG - Selected regions",
        }
    }

    pub fn from_name(name: &str) -> Option<InputName> {
        InputName::ALL
            .into_iter()
            .find(|input| input.as_str() == name || input.port_name() == name)
    }
}

impl fmt::Display for InputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four Keras models the cluster sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputName {
    BackgroundModel,
    MusicSymbolModel,
    StaffLinesModel,
    TextModel,
}

impl OutputName {
    pub const ALL: [OutputName; 4] = [
        OutputName::BackgroundModel,
        OutputName::MusicSymbolModel,
        OutputName::StaffLinesModel,
        OutputName::TextModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputName::BackgroundModel => "Background Model",
            OutputName::MusicSymbolModel => "Music Symbol Model",
            OutputName::StaffLinesModel => "Staff Lines Model",
            OutputName::TextModel => "Text Model",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            OutputName::BackgroundModel => "background_model.hdf5",
            OutputName::MusicSymbolModel => "music_symbol_model.hdf5",
            OutputName::StaffLinesModel => "staff_lines_model.hdf5",
            OutputName::TextModel => "text_model.hdf5",
        }
    }

    pub fn from_name(name: &str) -> Option<OutputName> {
        OutputName::ALL.into_iter().find(|output| output.as_str() == name)
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published to the work queue. Only `codec::build_request` constructs one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    inputs: BTreeMap<String, String>,
    settings: Settings,
}

impl JobRequest {
    pub(crate) fn new(inputs: BTreeMap<String, String>, settings: Settings) -> Self {
        Self { inputs, settings }
    }

    pub fn input(&self, name: InputName) -> Option<&str> {
        self.inputs.get(name.as_str()).map(String::as_str)
    }

    pub fn inputs(&self) -> &BTreeMap<String, String> {
        &self.inputs
    }

    pub fn setting(&self, name: &str) -> Option<&SettingValue> {
        self.settings.get(name)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// Reply body: output name to base64 payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobResponse {
    artifacts: BTreeMap<String, String>,
}

impl JobResponse {
    pub fn artifact(&self, name: OutputName) -> Option<&str> {
        self.artifacts.get(name.as_str()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl FromIterator<(String, String)> for JobResponse {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            artifacts: iter.into_iter().collect(),
        }
    }
}
