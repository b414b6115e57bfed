use serde::{Deserialize, Serialize};

use myosin_engine::{from_document, to_document, Document, ModelError, ModelId, StateModel};

/// Connectivity of the device's cloud link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub id: Option<ModelId>,
    pub online: bool,
}

impl StateModel for System {
    const TYPE_TAG: &'static str = "System";

    fn id(&self) -> Option<&ModelId> {
        self.id.as_ref()
    }

    fn dump(&self) -> Result<Document, ModelError> {
        to_document(self)
    }

    fn hydrate(&mut self, document: &Document) -> Result<(), ModelError> {
        *self = from_document(document)?;
        Ok(())
    }
}
