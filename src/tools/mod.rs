pub mod definition;
pub mod registry;

pub use definition::{
    serializer_for, DefinitionError, DefinitionRepository, DefinitionSerializer,
    JsonDefinitionSerializer, ParameterConstraint, ParameterDefinition, TomlDefinitionSerializer,
    ToolDefinition, ToolDefinitionStore,
};
pub use registry::{CapturingRegistry, InMemoryToolRegistry, Tool, ToolRegistry};
