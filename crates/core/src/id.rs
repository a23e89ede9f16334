//! Identifiers carried by scans, queued operations and orders.
//!
//! Organization and operator ids arrive from the auth layer as UUID strings.
//! Queue entries get a fresh UUIDv7, so ids minted on one device sort in the
//! order they were enqueued.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a time-ordered (v7) id.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        /// Accepts any UUID spelling `uuid` does; surrounding whitespace from
        /// env vars and form fields is ignored.
        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s.trim())
                    .map(Self)
                    .map_err(|e| DomainError::invalid_id(format!("{} id {:?}: {e}", $kind, s.trim())))
            }
        }
    };
}

uuid_id!(
    /// Organization owning the bottles, scans and orders. Every backend query
    /// is filtered on it.
    TenantId,
    "organization"
);

uuid_id!(
    /// Operator signed in on the scanner; written as `user_id` / `scanned_by`.
    UserId,
    "user"
);

uuid_id!(
    /// Entry in the offline action queue.
    OperationId,
    "operation"
);

#[cfg(test)]
mod tests {
    use super::*;

    const ORG: &str = "6f1c3b0e-8a4e-4d7a-9d35-2b6f1c9e0a11";

    #[test]
    fn organization_id_from_env_value() {
        let org: TenantId = format!("  {}\n", ORG.to_uppercase()).parse().unwrap();
        assert_eq!(org.to_string(), ORG);
    }

    #[test]
    fn bad_operator_id_names_the_kind_and_value() {
        match "scanner-7".parse::<UserId>().unwrap_err() {
            DomainError::InvalidId(msg) => assert!(msg.starts_with(r#"user id "scanner-7""#), "{msg}"),
        }
    }

    #[test]
    fn queue_ids_are_time_ordered() {
        let id = OperationId::new();
        assert_eq!(id.as_uuid().get_version_num(), 7);

        let earlier = OperationId::from_uuid(Uuid::from_u128(0x0190_0000_0000_7000_8000_0000_0000_0001));
        let later = OperationId::from_uuid(Uuid::from_u128(0x0190_0000_0001_7000_8000_0000_0000_0001));
        assert!(earlier < later);
    }

    #[test]
    fn ids_are_bare_strings_in_persisted_rows() {
        let org: TenantId = ORG.parse().unwrap();
        let row = serde_json::json!({ "organization_id": org });
        assert_eq!(row["organization_id"], ORG);

        let back: TenantId = serde_json::from_value(row["organization_id"].clone()).unwrap();
        assert_eq!(back, org);
    }
}
