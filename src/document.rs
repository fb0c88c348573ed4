//! Folding chronologically ordered operations into a document.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::opstore::{Operation, OperationType, document_id};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDocument {
    pub id: String,
    pub document: Value,
    pub deactivated: bool,
    /// Number of operations that changed the document.
    pub applied: usize,
}

pub trait DocumentBuilder: Send + Sync + 'static {
    /// `None` when no create operation is present.
    fn build(&self, namespace: &str, operations: &[Operation]) -> Option<ResolvedDocument>;
}

/// Creates set the document, updates apply an RFC 7386 merge patch, recovers replace the
/// document, deactivate is terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePatchBuilder;

impl DocumentBuilder for MergePatchBuilder {
    fn build(&self, namespace: &str, operations: &[Operation]) -> Option<ResolvedDocument> {
        let mut resolved: Option<ResolvedDocument> = None;
        for op in operations {
            match (&mut resolved, op.op_type) {
                (None, OperationType::Create) => {
                    resolved = Some(ResolvedDocument {
                        id: document_id(namespace, &op.unique_suffix),
                        document: field_or_self(&op.payload, "document"),
                        deactivated: false,
                        applied: 1,
                    });
                }
                // nothing exists yet, or a second create
                (None, _) | (Some(_), OperationType::Create) => {}
                (Some(doc), _) if doc.deactivated => {}
                (Some(doc), OperationType::Update) => {
                    merge_patch(&mut doc.document, &field_or_self(&op.payload, "patch"));
                    doc.applied += 1;
                }
                (Some(doc), OperationType::Recover) => {
                    doc.document = field_or_self(&op.payload, "document");
                    doc.applied += 1;
                }
                (Some(doc), OperationType::Deactivate) => {
                    doc.deactivated = true;
                    doc.applied += 1;
                }
            }
        }
        resolved
    }
}

fn field_or_self(payload: &Value, field: &str) -> Value {
    payload.get(field).cloned().unwrap_or_else(|| payload.clone())
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
