//! Building one request out of a batch.
//!
//! Every request of a batch gets an index, and everything it names at the top level of the
//! merged document is prefixed with `_<index>_`: response keys, variables and fragments. The
//! prefix is what lets a merged result be split back, see [`parse_key`].

use std::collections::HashSet;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::validation::WithErrors;

use super::ExtensionsReducer;
use crate::error::FetchError;
use crate::graphql;
use crate::json_ext::Object;
use crate::services::OperationKind;

/// Encodes `(index, key)` as a single response key.
pub fn prefixed_key(index: usize, key: &str) -> String {
    format!("_{index}_{key}")
}

/// Decodes a key produced by [`prefixed_key`].
pub fn parse_key(key: &str) -> Option<(usize, &str)> {
    let (index, original) = key.strip_prefix('_')?.split_once('_')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) || original.is_empty() {
        return None;
    }
    Some((index.parse().ok()?, original))
}

/// A submitted request, parsed down to the operation it runs.
pub(crate) struct PreparedRequest {
    pub(crate) request: graphql::Request,
    pub(crate) kind: OperationKind,
    operation: Node<ast::OperationDefinition>,
    fragments: Vec<Node<ast::FragmentDefinition>>,
}

impl PreparedRequest {
    pub(crate) fn new(request: graphql::Request) -> Result<Self, FetchError> {
        let query = request
            .query
            .as_deref()
            .ok_or_else(|| FetchError::MalformedRequest {
                reason: "request has no query".to_string(),
            })?;
        let document = ast::Document::parse(query, "request.graphql").map_err(
            |WithErrors { errors, .. }| FetchError::MalformedRequest {
                reason: errors.to_string(),
            },
        )?;

        let mut operations = Vec::new();
        let mut fragments = Vec::new();
        for definition in &document.definitions {
            match definition {
                ast::Definition::OperationDefinition(operation) => {
                    operations.push(operation.clone())
                }
                ast::Definition::FragmentDefinition(fragment) => fragments.push(fragment.clone()),
                _ => {}
            }
        }

        let operation = match request.operation_name.as_deref() {
            Some(name) => operations
                .into_iter()
                .find(|operation| operation.name.as_ref().is_some_and(|n| n.as_str() == name))
                .ok_or_else(|| FetchError::MalformedRequest {
                    reason: format!("operation '{name}' is not in the document"),
                })?,
            None if operations.len() == 1 => operations.remove(0),
            None => {
                return Err(FetchError::MalformedRequest {
                    reason: format!(
                        "document has {} operations and no operation name",
                        operations.len()
                    ),
                });
            }
        };

        Ok(PreparedRequest {
            kind: operation.operation_type.into(),
            request,
            operation,
            fragments,
        })
    }
}

/// Merges a batch into one anonymous operation.
///
/// Operation directives are dropped. The merged request keeps the operation type of the batch.
pub(crate) fn merge_requests<'a>(
    requests: impl IntoIterator<Item = &'a PreparedRequest>,
    reducer: &ExtensionsReducer,
) -> Result<graphql::Request, FetchError> {
    let mut merged_operation: Option<Node<ast::OperationDefinition>> = None;
    let mut variable_definitions = Vec::new();
    let mut selections = Vec::new();
    let mut fragments = Vec::new();
    let mut variables = Object::new();
    let mut extensions = Object::new();

    for (index, prepared) in requests.into_iter().enumerate() {
        let prefix = Prefix(index);
        let renamer = Renamer {
            prefix: &prefix,
            fragments: &prepared.fragments,
        };

        for variable in &prepared.operation.variables {
            let mut variable = variable.clone();
            let definition = variable.make_mut();
            definition.name = prefix.name(&definition.name)?;
            renamer.directives(&mut definition.directives)?;
            variable_definitions.push(variable);
        }

        for selection in &prepared.operation.selection_set {
            renamer.top_level(selection, &mut selections, &mut Vec::new())?;
        }

        for fragment in &prepared.fragments {
            let mut fragment = fragment.clone();
            let definition = fragment.make_mut();
            definition.name = prefix.name(&definition.name)?;
            renamer.directives(&mut definition.directives)?;
            renamer.nested(&mut definition.selection_set)?;
            fragments.push(fragment);
        }

        for (key, value) in prepared.request.variables.iter() {
            variables.insert(prefix.key(key.as_str()), value.clone());
        }
        extensions = reducer(extensions, &prepared.request);

        if merged_operation.is_none() {
            merged_operation = Some(prepared.operation.clone());
        }
    }

    let Some(mut operation) = merged_operation else {
        return Err(FetchError::MalformedRequest {
            reason: "cannot merge an empty batch".to_string(),
        });
    };
    let definition = operation.make_mut();
    definition.name = None;
    definition.directives = ast::DirectiveList(vec![]);
    definition.variables = variable_definitions;
    definition.selection_set = selections;

    let mut document = ast::Document::new();
    document
        .definitions
        .push(ast::Definition::OperationDefinition(operation));
    // fragments only spread at the top level were inlined
    let used = used_fragments(&document, &fragments);
    document.definitions.extend(
        fragments
            .into_iter()
            .filter(|fragment| used.contains(&fragment.name))
            .map(ast::Definition::FragmentDefinition),
    );

    Ok(graphql::Request::builder()
        .query(document.to_string())
        .variables(variables)
        .extensions(extensions)
        .build())
}

struct Prefix(usize);

impl Prefix {
    fn key(&self, key: &str) -> String {
        prefixed_key(self.0, key)
    }

    fn name(&self, name: &Name) -> Result<Name, FetchError> {
        Name::new(&self.key(name.as_str())).map_err(|error| FetchError::MalformedRequest {
            reason: error.to_string(),
        })
    }
}

struct Renamer<'a> {
    prefix: &'a Prefix,
    fragments: &'a [Node<ast::FragmentDefinition>],
}

impl Renamer<'_> {
    /// Copies a top level selection into `out`, aliasing its fields.
    ///
    /// Inline fragments keep their place with aliased contents; fragment spreads become inline
    /// fragments, since a fragment definition cannot carry per request aliases.
    fn top_level(
        &self,
        selection: &ast::Selection,
        out: &mut Vec<ast::Selection>,
        inlining: &mut Vec<Name>,
    ) -> Result<(), FetchError> {
        match selection {
            ast::Selection::Field(field) => {
                let mut field = field.clone();
                let definition = field.make_mut();
                let response_key = definition.alias.as_ref().unwrap_or(&definition.name);
                definition.alias = Some(self.prefix.name(response_key)?);
                self.arguments(&mut definition.arguments)?;
                self.directives(&mut definition.directives)?;
                self.nested(&mut definition.selection_set)?;
                out.push(ast::Selection::Field(field));
            }
            ast::Selection::InlineFragment(inline) => {
                let mut inline = inline.clone();
                let definition = inline.make_mut();
                self.directives(&mut definition.directives)?;
                let mut selection_set = Vec::with_capacity(definition.selection_set.len());
                for selection in &definition.selection_set {
                    self.top_level(selection, &mut selection_set, inlining)?;
                }
                definition.selection_set = selection_set;
                out.push(ast::Selection::InlineFragment(inline));
            }
            ast::Selection::FragmentSpread(spread) => {
                let fragment = self
                    .fragments
                    .iter()
                    .find(|fragment| fragment.name == spread.fragment_name)
                    .ok_or_else(|| FetchError::MalformedRequest {
                        reason: format!("unknown fragment '{}'", spread.fragment_name),
                    })?;
                if inlining.contains(&fragment.name) {
                    return Err(FetchError::MalformedRequest {
                        reason: format!("fragment '{}' spreads itself", fragment.name),
                    });
                }

                inlining.push(fragment.name.clone());
                let mut selection_set = Vec::with_capacity(fragment.selection_set.len());
                for selection in &fragment.selection_set {
                    self.top_level(selection, &mut selection_set, inlining)?;
                }
                inlining.pop();

                let mut directives = spread.directives.clone();
                self.directives(&mut directives)?;
                out.push(ast::Selection::InlineFragment(Node::new(
                    ast::InlineFragment {
                        type_condition: Some(fragment.type_condition.clone()),
                        directives,
                        selection_set,
                    },
                )));
            }
        }
        Ok(())
    }

    /// Renames variables and fragment spreads below the top level. Response keys stay as is.
    fn nested(&self, selection_set: &mut [ast::Selection]) -> Result<(), FetchError> {
        for selection in selection_set {
            match selection {
                ast::Selection::Field(field) => {
                    let field = field.make_mut();
                    self.arguments(&mut field.arguments)?;
                    self.directives(&mut field.directives)?;
                    self.nested(&mut field.selection_set)?;
                }
                ast::Selection::InlineFragment(inline) => {
                    let inline = inline.make_mut();
                    self.directives(&mut inline.directives)?;
                    self.nested(&mut inline.selection_set)?;
                }
                ast::Selection::FragmentSpread(spread) => {
                    let spread = spread.make_mut();
                    spread.fragment_name = self.prefix.name(&spread.fragment_name)?;
                    self.directives(&mut spread.directives)?;
                }
            }
        }
        Ok(())
    }

    fn directives(&self, directives: &mut ast::DirectiveList) -> Result<(), FetchError> {
        for directive in directives.0.iter_mut() {
            self.arguments(&mut directive.make_mut().arguments)?;
        }
        Ok(())
    }

    fn arguments(&self, arguments: &mut [Node<ast::Argument>]) -> Result<(), FetchError> {
        for argument in arguments {
            if mentions_variable(&argument.value) {
                self.value(&mut argument.make_mut().value)?;
            }
        }
        Ok(())
    }

    fn value(&self, value: &mut Node<ast::Value>) -> Result<(), FetchError> {
        match value.make_mut() {
            ast::Value::Variable(name) => *name = self.prefix.name(name)?,
            ast::Value::List(items) => {
                for item in items {
                    self.value(item)?;
                }
            }
            ast::Value::Object(fields) => {
                for (_, item) in fields {
                    self.value(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn mentions_variable(value: &ast::Value) -> bool {
    match value {
        ast::Value::Variable(_) => true,
        ast::Value::List(items) => items.iter().any(|item| mentions_variable(item)),
        ast::Value::Object(fields) => fields.iter().any(|(_, item)| mentions_variable(item)),
        _ => false,
    }
}

/// Names of the fragments reachable from the operations of `document`.
fn used_fragments(
    document: &ast::Document,
    fragments: &[Node<ast::FragmentDefinition>],
) -> HashSet<Name> {
    let mut pending = Vec::new();
    for definition in &document.definitions {
        if let ast::Definition::OperationDefinition(operation) = definition {
            collect_spreads(&operation.selection_set, &mut pending);
        }
    }

    let mut used = HashSet::new();
    while let Some(name) = pending.pop() {
        if used.insert(name.clone())
            && let Some(fragment) = fragments.iter().find(|fragment| fragment.name == name)
        {
            collect_spreads(&fragment.selection_set, &mut pending);
        }
    }
    used
}

fn collect_spreads(selection_set: &[ast::Selection], out: &mut Vec<Name>) {
    for selection in selection_set {
        match selection {
            ast::Selection::Field(field) => collect_spreads(&field.selection_set, out),
            ast::Selection::InlineFragment(inline) => collect_spreads(&inline.selection_set, out),
            ast::Selection::FragmentSpread(spread) => out.push(spread.fragment_name.clone()),
        }
    }
}
