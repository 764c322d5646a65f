use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use svq_common::{Result, SvqError};
use svq_planner::{OperatorNode, Plan};

/// A named service pipeline and the node whose rows queries read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub pipeline: Plan,
    /// Name of the output node inside `pipeline`.
    pub output: String,
    /// Default parameter values; pushed-down query values override them.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, pipeline: Plan, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline,
            output: output.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// The designated output node.
    pub fn output_node(&self) -> Result<&OperatorNode> {
        self.pipeline.node_by_name(&self.output).ok_or_else(|| {
            SvqError::ServiceResolution(format!(
                "service '{}' has no output node named '{}'",
                self.name, self.output
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        self.pipeline.validate().map_err(|e| {
            SvqError::InvalidConfig(format!("pipeline of service '{}': {e}", self.name))
        })?;
        self.output_node()?;
        Ok(())
    }
}

/// Loads service definitions by name.
pub trait ServiceResolver: Send + Sync {
    fn load_service(&self, name: &str) -> Result<ServiceDefinition>;
}

/// In-memory service registry, optionally loaded from a JSON file holding
/// an array of [`ServiceDefinition`]s.
#[derive(Debug, Default, Clone)]
pub struct ServiceCatalog {
    services: HashMap<String, ServiceDefinition>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a service after checking its pipeline and
    /// output node.
    pub fn register_service(&mut self, service: ServiceDefinition) -> Result<()> {
        service.validate()?;
        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ServiceDefinition> {
        self.services
            .get(name)
            .ok_or_else(|| SvqError::ServiceResolution(format!("unknown service: {name}")))
    }

    /// Registered services, sorted by name.
    pub fn services(&self) -> Vec<&ServiceDefinition> {
        let mut out: Vec<_> = self.services.values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn load_from_json_str(json: &str) -> Result<Self> {
        let services: Vec<ServiceDefinition> =
            serde_json::from_str(json).map_err(|e| SvqError::InvalidConfig(e.to_string()))?;
        let mut catalog = Self::new();
        for s in services {
            catalog.register_service(s)?;
        }
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::load_from_json_str(&s)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.services())
            .map_err(|e| SvqError::InvalidConfig(e.to_string()))
    }
}

impl ServiceResolver for ServiceCatalog {
    fn load_service(&self, name: &str) -> Result<ServiceDefinition> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::DataType;
    use svq_planner::{ColumnDef, LiteralValue, OperatorKind, PlanGraph, RowSchema};

    fn numbers() -> Plan {
        let schema = RowSchema::new(vec![ColumnDef::new("a", DataType::Int64)]).expect("schema");
        let mut g = PlanGraph::new("numbers");
        let src = g.add_node(
            "Rows",
            OperatorKind::RowSource(vec![vec![LiteralValue::Int64(1)]]),
            schema.clone(),
        );
        let out = g.add_node("Output", OperatorKind::Dummy, schema);
        g.connect(src, out);
        g.finish(src, out).expect("plan")
    }

    #[test]
    fn rejects_a_missing_output_node() {
        let mut catalog = ServiceCatalog::new();
        let err = catalog
            .register_service(ServiceDefinition::new("numbers", numbers(), "Nope"))
            .expect_err("must fail");
        assert!(matches!(err, SvqError::ServiceResolution(_)));
        assert!(matches!(
            catalog.load_service("numbers"),
            Err(SvqError::ServiceResolution(_))
        ));
    }

    #[test]
    fn json_round_trip() {
        let mut catalog = ServiceCatalog::new();
        catalog
            .register_service(
                ServiceDefinition::new("numbers", numbers(), "Output").with_parameter("p", "1"),
            )
            .expect("register");
        let json = catalog.to_json().expect("json");
        let back = ServiceCatalog::load_from_json_str(&json).expect("load");
        let def = back.load_service("numbers").expect("service");
        assert_eq!(def.output, "Output");
        assert_eq!(def.parameters.get("p").map(String::as_str), Some("1"));
        assert_eq!(def.pipeline.nodes(), numbers().nodes());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            ServiceCatalog::load_from_json_str("{"),
            Err(SvqError::InvalidConfig(_))
        ));
    }
}
