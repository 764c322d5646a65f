//! Lowering of `IIF(condition, when_true, when_false)` into a
//! filter / branch / branch / merge subgraph.
//!
//! ```text
//!                  true   -> [copy field | constant] --\
//! pred -> [filter]                                      -> [merge]
//!                  false  -> [copy field | constant] --/
//! ```
//!
//! Every row reaching the filter leaves through exactly one branch as exactly
//! one row, so the merge emits as many rows as the filter receives.

use arrow_schema::DataType;
use svq_common::{NodeId, Result, SvqError};

use crate::plan::{
    BranchTarget, ConstantField, CopyFieldConfig, FilterConfig, OperatorKind, PlanGraph,
};
use crate::query::{IifValue, SelectField};
use crate::schema::{ColumnDef, RowSchema};

/// Lower one IIF field after `predecessor`; returns the merge node (new tail).
pub fn lower_iif(field: &SelectField, graph: &mut PlanGraph, predecessor: NodeId) -> Result<NodeId> {
    let iif = field.iif().ok_or_else(|| {
        SvqError::PlanConstruction(format!("field '{}' is not an IIF expression", field.name()))
    })?;
    let input = graph.schema(predecessor)?.clone();
    let target = field.column_name();
    if input.contains(&target) {
        return Err(SvqError::PlanConstruction(format!(
            "IIF target '{target}' collides with an existing field"
        )));
    }
    let target_type = branch_type(&iif.when_true, &input)?;
    let target_type = match target_type {
        DataType::Null => branch_type(&iif.when_false, &input)?,
        t => t,
    };
    let column = ColumnDef::new(&target, target_type.clone());
    let output = input.with_column(column)?;

    let condition = iif.condition.bind_plain(&input)?;
    let filter = graph.add_node(
        format!("IIF {target} filter"),
        OperatorKind::Filter(FilterConfig::new(condition)),
        input.clone(),
    );
    graph.connect(predecessor, filter);

    let when_true = branch_node(
        graph,
        format!("IIF {target} true"),
        &iif.when_true,
        &input,
        &target,
        &target_type,
        &output,
    )?;
    graph.connect_branch(filter, when_true, BranchTarget::True)?;

    let when_false = branch_node(
        graph,
        format!("IIF {target} false"),
        &iif.when_false,
        &input,
        &target,
        &target_type,
        &output,
    )?;
    graph.connect_branch(filter, when_false, BranchTarget::False)?;

    let merge = graph.add_node(format!("IIF {target} merge"), OperatorKind::Dummy, output);
    graph.connect(when_true, merge);
    graph.connect(when_false, merge);
    Ok(merge)
}

fn branch_type(value: &IifValue, input: &RowSchema) -> Result<DataType> {
    match value {
        IifValue::Literal(v) => Ok(v.data_type()),
        IifValue::Field(name) => {
            let idx = input.resolve(name)?;
            Ok(input.columns()[idx].data_type.clone())
        }
    }
}

fn branch_node(
    graph: &mut PlanGraph,
    name: String,
    value: &IifValue,
    input: &RowSchema,
    target: &str,
    target_type: &DataType,
    output: &RowSchema,
) -> Result<NodeId> {
    let kind = match value {
        IifValue::Field(source) => OperatorKind::CopyField(CopyFieldConfig {
            source: input.resolve(source)?,
            target: target.to_string(),
            data_type: target_type.clone(),
        }),
        IifValue::Literal(v) => OperatorKind::ConstantRow(vec![ConstantField {
            name: target.to_string(),
            value: v.cast_to(target_type)?,
            data_type: target_type.clone(),
        }]),
    };
    Ok(graph.add_node(name, kind, output.clone()))
}
