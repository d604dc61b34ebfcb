//! Common types used throughout ClientSync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque structured payload returned by the remote service.
///
/// The core never inspects it beyond structural equality.
pub type Payload = serde_json::Value;

/// Extension shared by snapshot and archive files.
pub const SNAPSHOT_EXTENSION: &str = "json";

/// One of the three datasets pulled from the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Clients,
    Contacts,
    FeaturedClients,
}

impl DatasetKind {
    /// All kinds, in the order they are reported.
    pub const ALL: [DatasetKind; 3] = [
        DatasetKind::Clients,
        DatasetKind::Contacts,
        DatasetKind::FeaturedClients,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Clients => "clients",
            DatasetKind::Contacts => "contacts",
            DatasetKind::FeaturedClients => "featured_clients",
        }
    }

    /// Name of the current snapshot file, e.g. `clients.json`.
    pub fn main_file_name(&self) -> String {
        format!("{}.{}", self.as_str(), SNAPSHOT_EXTENSION)
    }

    /// Name of an archive file for the given cycle timestamp,
    /// e.g. `clients_20240101120000.json`.
    pub fn archive_file_name(&self, timestamp: &str) -> String {
        format!("{}_{}.{}", self.as_str(), timestamp, SNAPSHOT_EXTENSION)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        DatasetKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown dataset kind: {}", s)))
    }
}

/// One value per dataset kind.
///
/// There is no way to build a partial instance, so anything typed as
/// `PerDataset<T>` always covers all three kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerDataset<T> {
    pub clients: T,
    pub contacts: T,
    pub featured_clients: T,
}

impl<T> PerDataset<T> {
    pub fn new(clients: T, contacts: T, featured_clients: T) -> Self {
        Self {
            clients,
            contacts,
            featured_clients,
        }
    }

    /// Build by calling `f` once per kind.
    pub fn from_fn(mut f: impl FnMut(DatasetKind) -> T) -> Self {
        Self {
            clients: f(DatasetKind::Clients),
            contacts: f(DatasetKind::Contacts),
            featured_clients: f(DatasetKind::FeaturedClients),
        }
    }

    pub fn get(&self, kind: DatasetKind) -> &T {
        match kind {
            DatasetKind::Clients => &self.clients,
            DatasetKind::Contacts => &self.contacts,
            DatasetKind::FeaturedClients => &self.featured_clients,
        }
    }

    pub fn get_mut(&mut self, kind: DatasetKind) -> &mut T {
        match kind {
            DatasetKind::Clients => &mut self.clients,
            DatasetKind::Contacts => &mut self.contacts,
            DatasetKind::FeaturedClients => &mut self.featured_clients,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DatasetKind, &T)> {
        DatasetKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }

    pub fn map<U>(self, mut f: impl FnMut(DatasetKind, T) -> U) -> PerDataset<U> {
        PerDataset {
            clients: f(DatasetKind::Clients, self.clients),
            contacts: f(DatasetKind::Contacts, self.contacts),
            featured_clients: f(DatasetKind::FeaturedClients, self.featured_clients),
        }
    }
}

impl PerDataset<bool> {
    /// Whether any entry is set.
    pub fn any(&self) -> bool {
        self.clients || self.contacts || self.featured_clients
    }

    /// Number of entries that are set.
    pub fn count(&self) -> usize {
        self.iter().filter(|(_, set)| **set).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(DatasetKind::Clients.main_file_name(), "clients.json");
        assert_eq!(
            DatasetKind::FeaturedClients.archive_file_name("20240131235959"),
            "featured_clients_20240131235959.json"
        );
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(
            "featured_clients".parse::<DatasetKind>().unwrap(),
            DatasetKind::FeaturedClients
        );
        assert!("orders".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn test_per_dataset_access() {
        let mut flags = PerDataset::from_fn(|kind| kind == DatasetKind::Contacts);
        assert!(flags.any());
        assert_eq!(flags.count(), 1);

        *flags.get_mut(DatasetKind::Clients) = true;
        assert_eq!(flags.count(), 2);

        let names: Vec<_> = flags.iter().map(|(kind, _)| kind.as_str()).collect();
        assert_eq!(names, vec!["clients", "contacts", "featured_clients"]);
    }
}
