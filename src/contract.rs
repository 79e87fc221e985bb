use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::NativeBody;
use crate::sandbox::SourceUnit;

/// Declared input file for cache key generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub required: bool,
}

/// Declared output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub required: bool,
}

/// Declared parameter, with an optional default applied when absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// A function's declared calling contract.
///
/// `name` and `version` are identity-bearing for caching: bumping the version
/// changes every descriptor hash the function produces. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionContract {
    pub name: String,
    pub version: String,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub parameters: Vec<ParameterSpec>,
}

impl FunctionContract {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> ContractBuilder {
        ContractBuilder {
            contract: FunctionContract {
                name: name.into(),
                version: version.into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                parameters: Vec::new(),
            },
        }
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|s| s.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|s| s.name == name)
    }

    /// True if the name is declared as an input, output, or parameter.
    pub fn declares(&self, name: &str) -> bool {
        self.input(name).is_some() || self.output(name).is_some() || self.parameter(name).is_some()
    }
}

/// Builder for [`FunctionContract`].
///
/// Replaces attribute injection on the function itself: declarations are
/// explicit values, associated with a body at registration time.
pub struct ContractBuilder {
    contract: FunctionContract,
}

impl ContractBuilder {
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.contract.inputs.push(InputSpec {
            name: name.into(),
            required: true,
        });
        self
    }

    pub fn optional_input(mut self, name: impl Into<String>) -> Self {
        self.contract.inputs.push(InputSpec {
            name: name.into(),
            required: false,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.contract.outputs.push(OutputSpec {
            name: name.into(),
            required: true,
        });
        self
    }

    pub fn optional_output(mut self, name: impl Into<String>) -> Self {
        self.contract.outputs.push(OutputSpec {
            name: name.into(),
            required: false,
        });
        self
    }

    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.contract.parameters.push(ParameterSpec {
            name: name.into(),
            required: true,
            default: None,
        });
        self
    }

    pub fn optional_parameter(mut self, name: impl Into<String>) -> Self {
        self.contract.parameters.push(ParameterSpec {
            name: name.into(),
            required: false,
            default: None,
        });
        self
    }

    pub fn parameter_with_default(
        mut self,
        name: impl Into<String>,
        default: impl Into<Value>,
    ) -> Self {
        self.contract.parameters.push(ParameterSpec {
            name: name.into(),
            required: false,
            default: Some(default.into()),
        });
        self
    }

    pub fn build(self) -> FunctionContract {
        self.contract
    }
}

/// A registered function: contract, native body, and (optionally) the
/// portable source unit that makes it container-eligible.
pub struct RegisteredFunction {
    pub contract: FunctionContract,
    pub body: NativeBody,
    pub source: Option<SourceUnit>,
}

/// Registry of callable functions, keyed by name + version.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<(String, String), RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, contract: FunctionContract, body: NativeBody) {
        self.insert(RegisteredFunction {
            contract,
            body,
            source: None,
        });
    }

    pub fn register_with_source(
        &mut self,
        contract: FunctionContract,
        body: NativeBody,
        source: SourceUnit,
    ) {
        self.insert(RegisteredFunction {
            contract,
            body,
            source: Some(source),
        });
    }

    fn insert(&mut self, function: RegisteredFunction) {
        let key = (
            function.contract.name.clone(),
            function.contract.version.clone(),
        );
        self.functions.insert(key, function);
    }

    pub fn get(&self, name: &str, version: &str) -> Option<&RegisteredFunction> {
        self.functions.get(&(name.to_string(), version.to_string()))
    }
}
