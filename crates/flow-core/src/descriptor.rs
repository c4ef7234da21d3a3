//! Tool descriptor trait and metadata types
//!
//! A [`ToolDefinition`] describes a capability a task can invoke: its
//! display metadata and its input/output schema. Built-in tools describe
//! themselves through [`ToolDescriptor`] and register at link time:
//!
//! ```ignore
//! use flow_core::{ToolDescriptor, ToolDefinition, ToolProperty};
//!
//! struct Echo;
//!
//! impl ToolDescriptor for Echo {
//!     fn descriptor() -> ToolDefinition {
//!         ToolDefinition::new("echo", "Echo", "utility")
//!             .with_input(ToolProperty::required("text", "Text", "string"))
//!             .with_output(ToolProperty::optional("text", "Text", "string"))
//!     }
//! }
//!
//! inventory::submit!(flow_core::ToolDescriptorFn(Echo::descriptor));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::TaskType;

/// Trait for tools that can describe their metadata
pub trait ToolDescriptor {
    /// Get the static definition for this tool
    fn descriptor() -> ToolDefinition
    where
        Self: Sized;
}

/// Function pointer collected at link time by `ToolRegistry::with_builtins`
pub struct ToolDescriptorFn(pub fn() -> ToolDefinition);

inventory::collect!(ToolDescriptorFn);

/// Extra options on a property type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeOptions {
    /// The property holds a list of values
    #[serde(default)]
    pub multiple_values: bool,
}

/// One input or output field of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProperty {
    pub name: String,
    pub display_name: String,
    /// Value type, e.g. "string", "number", "boolean", "json", "file"
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    /// Nested fields of an object-typed property
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<ToolProperty>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_options: Option<TypeOptions>,
}

impl ToolProperty {
    /// Create a new property
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        property_type: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            property_type: property_type.into(),
            description: None,
            default: None,
            required,
            properties: None,
            type_options: None,
        }
    }

    /// Create a required property
    pub fn required(
        name: impl Into<String>,
        display_name: impl Into<String>,
        property_type: impl Into<String>,
    ) -> Self {
        Self::new(name, display_name, property_type, true)
    }

    /// Create an optional property
    pub fn optional(
        name: impl Into<String>,
        display_name: impl Into<String>,
        property_type: impl Into<String>,
    ) -> Self {
        Self::new(name, display_name, property_type, false)
    }

    /// Mark this property as holding a list of values
    pub fn multiple(mut self) -> Self {
        self.type_options = Some(TypeOptions {
            multiple_values: true,
        });
        self
    }

    /// Attach nested fields
    pub fn with_properties(mut self, properties: Vec<ToolProperty>) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Set the default value used when a task is created from the tool
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// The property takes a list of values
    pub fn is_multiple(&self) -> bool {
        self.type_options
            .as_ref()
            .is_some_and(|options| options.multiple_values)
    }
}

/// Registry entry for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name; tasks reference it through `Task::name`
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Palette category
    #[serde(default)]
    pub category: String,
    /// Task type created from this tool
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub input: Vec<ToolProperty>,
    #[serde(default)]
    pub output: Vec<ToolProperty>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolDefinition {
    /// Create a SIMPLE tool with no properties
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: String::new(),
            icon: None,
            category: category.into(),
            task_type: TaskType::Simple,
            input: Vec::new(),
            output: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Task type created by this tool
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the icon
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Add an input property
    pub fn with_input(mut self, property: ToolProperty) -> Self {
        self.input.push(property);
        self
    }

    /// Add an output property
    pub fn with_output(mut self, property: ToolProperty) -> Self {
        self.output.push(property);
        self
    }

    /// Default `inputParameters` for a task created from this tool
    pub fn default_inputs(&self) -> Map<String, Value> {
        self.input
            .iter()
            .filter_map(|property| {
                property
                    .default
                    .clone()
                    .map(|value| (property.name.clone(), value))
            })
            .collect()
    }

    /// Case-insensitive match against name, display name and description
    pub fn matches(&self, search: &str) -> bool {
        let needle = search.trim().to_lowercase();
        needle.is_empty()
            || self.name.to_lowercase().contains(&needle)
            || self.display_name.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
    }
}
