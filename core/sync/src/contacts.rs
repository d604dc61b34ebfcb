//! Contact view over the local snapshots.
//!
//! `contacts.json` holds `{"contactos": [...]}` and `clients.json` holds
//! `{"Clientes": [...]}`. A contact is a client when a client with the
//! same `id` exists.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

use clientsync_common::{DatasetKind, Error, Payload, Result};

use crate::store::DeltaStore;

/// Placeholder for a name or email the remote service left empty.
pub const UNKNOWN: &str = "Desconocido";

const CONTACTS_KEY: &str = "contactos";
const CLIENTS_KEY: &str = "Clientes";

/// One contact as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    pub id: Value,
    pub name: String,
    pub email: String,
    pub is_client: bool,
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Value::String(id) => writeln!(f, "ID: {}", id)?,
            id => writeln!(f, "ID: {}", id)?,
        }
        writeln!(f, "    Name: {}", self.name)?;
        writeln!(f, "    Email: {}", self.email)?;
        write!(
            f,
            "    Client: {}",
            if self.is_client { "yes" } else { "no" }
        )
    }
}

fn entries<'a>(payload: &'a Payload, key: &str, file: &str) -> Result<&'a Vec<Value>> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Decode(format!("{} has no '{}' list", file, key)))
}

/// Text field with the remote service's "no value" markers mapped to [`UNKNOWN`].
fn text_field(entry: &Value, key: &str) -> String {
    match entry.get(key) {
        Some(Value::String(text)) => text.clone(),
        None | Some(Value::Null) | Some(Value::Bool(false)) => UNKNOWN.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Build the contact view from the two snapshot payloads.
pub fn parse_contacts(contacts: &Payload, clients: &Payload) -> Result<Vec<Contact>> {
    let contacts = entries(contacts, CONTACTS_KEY, "contacts.json")?;
    let client_ids: Vec<&Value> = entries(clients, CLIENTS_KEY, "clients.json")?
        .iter()
        .filter_map(|client| client.get("id"))
        .collect();

    contacts
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let id = entry
                .get("id")
                .cloned()
                .ok_or_else(|| Error::Decode(format!("contact #{} has no id", index)))?;
            Ok(Contact {
                is_client: client_ids.contains(&&id),
                name: text_field(entry, "name"),
                email: text_field(entry, "email"),
                id,
            })
        })
        .collect()
}

/// Load the contact view from the snapshots in `store`.
pub async fn load_contacts(store: &DeltaStore) -> Result<Vec<Contact>> {
    let contacts = store.load(DatasetKind::Contacts).await?;
    let clients = store.load(DatasetKind::Clients).await?;
    parse_contacts(&contacts, &clients)
}
