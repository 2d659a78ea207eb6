//! Credential store backed by the freedesktop Secret Service.
//!
//! Queries whatever provides `org.freedesktop.secrets` on the session bus
//! (GNOME Keyring, KWallet, KeePassXC and others).  Entries are matched by
//! their `service` and `description` attributes; this is the layout
//! `secret-tool store --label=... service <path> description "ssh key passphrase"`
//! produces.
//!
//! Lookups never write to the store.  A locked match is unlocked through the
//! provider's own prompt, which is why callers should bound
//! [`CredentialStore::resolve`] with a deadline.

use std::collections::HashMap;

use agentload_core::credential::exactly_one;
use agentload_core::{CredentialError, CredentialQuery, CredentialStore, Passphrase};
use futures::StreamExt as _;
use tracing::debug;
use zbus::Connection;
use zeroize::Zeroizing;
use zvariant::{OwnedObjectPath, OwnedValue};

const BUS_NAME: &str = "org.freedesktop.secrets";
const SERVICE_PATH: &str = "/org/freedesktop/secrets";
const SERVICE_IFACE: &str = "org.freedesktop.Secret.Service";
const ITEM_IFACE: &str = "org.freedesktop.Secret.Item";
const PROMPT_IFACE: &str = "org.freedesktop.Secret.Prompt";

/// `(session, parameters, value, content_type)` as returned by `Item.GetSecret`.
type SecretStruct = (OwnedObjectPath, Vec<u8>, Vec<u8>, String);

/// Secret Service credential store.
///
/// The bus connection is opened on first use, so a store that is never
/// queried never touches D-Bus.
#[derive(Debug, Clone, Default)]
pub struct SecretServiceStore {
    conn: Option<Connection>,
}

impl SecretServiceStore {
    /// Store that connects to the session bus on first lookup.
    pub fn session() -> Self {
        Self { conn: None }
    }

    pub fn with_connection(conn: Connection) -> Self {
        Self { conn: Some(conn) }
    }

    async fn connection(&self) -> Result<Connection, CredentialError> {
        match &self.conn {
            Some(conn) => Ok(conn.clone()),
            None => Connection::session()
                .await
                .map_err(|e| unavailable("connect to session bus", e)),
        }
    }

    /// Unlock `item`, following the provider's prompt if it asks for one.
    async fn unlock(
        conn: &Connection,
        service: &zbus::Proxy<'_>,
        item: &OwnedObjectPath,
    ) -> Result<(), CredentialError> {
        let (unlocked, prompt): (Vec<OwnedObjectPath>, OwnedObjectPath) = service
            .call("Unlock", &(vec![item.clone()],))
            .await
            .map_err(|e| unavailable("Unlock", e))?;

        if unlocked.iter().any(|p| p == item) || prompt.as_str() == "/" {
            return Ok(());
        }

        debug!(prompt = %prompt.as_str(), "secret-service: waiting for unlock prompt");
        let prompt_proxy = zbus::Proxy::new(conn, BUS_NAME, prompt.as_str(), PROMPT_IFACE)
            .await
            .map_err(|e| unavailable("Prompt proxy", e))?;

        // Subscribe before triggering the prompt so the signal cannot be missed.
        let mut completed = prompt_proxy
            .receive_signal("Completed")
            .await
            .map_err(|e| unavailable("subscribe to Prompt.Completed", e))?;
        let () = prompt_proxy
            .call("Prompt", &("",))
            .await
            .map_err(|e| unavailable("Prompt", e))?;

        let msg = completed
            .next()
            .await
            .ok_or_else(|| CredentialError::Unavailable("prompt closed without completing".to_string()))?;
        let body = msg.body();
        let (dismissed, _result): (bool, OwnedValue) = body
            .deserialize()
            .map_err(|e| unavailable("decode Prompt.Completed", e))?;

        prompt_outcome(dismissed)
    }

    async fn read_secret(
        conn: &Connection,
        service: &zbus::Proxy<'_>,
        item: &OwnedObjectPath,
    ) -> Result<Passphrase, CredentialError> {
        let (_, session): (OwnedValue, OwnedObjectPath) = service
            .call("OpenSession", &("plain", zvariant::Value::from("")))
            .await
            .map_err(|e| unavailable("OpenSession", e))?;

        let result = Self::get_secret(conn, item, &session).await;

        // Close the session on every path.  A close failure does not
        // replace the read result.
        let close: Result<(), zbus::Error> = async {
            let proxy = zbus::Proxy::new(
                conn,
                BUS_NAME,
                session.as_str(),
                "org.freedesktop.Secret.Session",
            )
            .await?;
            proxy.call("Close", &()).await
        }
        .await;

        after_close(result, close)
    }

    async fn get_secret(
        conn: &Connection,
        item: &OwnedObjectPath,
        session: &OwnedObjectPath,
    ) -> Result<Passphrase, CredentialError> {
        let item_proxy = zbus::Proxy::new(conn, BUS_NAME, item.as_str(), ITEM_IFACE)
            .await
            .map_err(|e| unavailable("Item proxy", e))?;

        let (_session, _params, value, _content_type): SecretStruct = item_proxy
            .call("GetSecret", &(session,))
            .await
            .map_err(|e| unavailable("GetSecret", e))?;

        Ok(Passphrase::from_zeroizing(Zeroizing::new(value)))
    }
}

#[async_trait::async_trait]
impl CredentialStore for SecretServiceStore {
    fn name(&self) -> &str {
        "secret-service"
    }

    async fn resolve(&self, query: &CredentialQuery) -> Result<Passphrase, CredentialError> {
        let conn = self.connection().await?;
        let service = zbus::Proxy::new(&conn, BUS_NAME, SERVICE_PATH, SERVICE_IFACE)
            .await
            .map_err(|e| unavailable("Secret Service proxy", e))?;

        let attrs: HashMap<&str, &str> = HashMap::from([
            ("service", query.service.as_str()),
            ("description", query.description.as_str()),
        ]);
        let (unlocked, locked): (Vec<OwnedObjectPath>, Vec<OwnedObjectPath>) = service
            .call("SearchItems", &(attrs,))
            .await
            .map_err(|e| unavailable("SearchItems", e))?;

        debug!(
            service = %query.service,
            unlocked = unlocked.len(),
            locked = locked.len(),
            "secret-service: search"
        );

        let (item, needs_unlock) = select_item(unlocked, locked, query)?;

        if needs_unlock {
            Self::unlock(&conn, &service, &item).await?;
        }

        Self::read_secret(&conn, &service, &item).await
    }
}

/// Apply the exactly-one rule across unlocked and locked matches together.
/// Returns the item and whether it has to be unlocked first.
fn select_item(
    unlocked: Vec<OwnedObjectPath>,
    locked: Vec<OwnedObjectPath>,
    query: &CredentialQuery,
) -> Result<(OwnedObjectPath, bool), CredentialError> {
    let needs_unlock = unlocked.is_empty();
    let item = exactly_one(unlocked.into_iter().chain(locked).collect(), query)?;
    Ok((item, needs_unlock))
}

/// The read result survives a failed `Session.Close`; the failure is logged.
fn after_close<T>(
    result: Result<T, CredentialError>,
    close: Result<(), zbus::Error>,
) -> Result<T, CredentialError> {
    if let Err(e) = close {
        debug!(error = %e, "secret-service: failed to close session");
    }
    result
}

/// Map the `dismissed` flag of `Prompt.Completed`.
fn prompt_outcome(dismissed: bool) -> Result<(), CredentialError> {
    if dismissed {
        return Err(CredentialError::Unavailable(
            "unlock prompt was dismissed".to_string(),
        ));
    }
    Ok(())
}

fn unavailable(what: &str, err: impl std::fmt::Display) -> CredentialError {
    CredentialError::Unavailable(format!("{what}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_store_does_not_connect_eagerly() {
        // Constructing the store must work without a session bus.
        let store = SecretServiceStore::session();
        assert!(store.conn.is_none());
        assert_eq!(store.name(), "secret-service");
    }

    fn path(p: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(p).unwrap()
    }

    fn query() -> CredentialQuery {
        CredentialQuery::for_service("/home/u/.ssh/id_rsa")
    }

    #[test]
    fn single_unlocked_match_needs_no_unlock() {
        let a = path("/org/freedesktop/secrets/collection/login/1");
        let (item, needs_unlock) = select_item(vec![a.clone()], Vec::new(), &query()).unwrap();
        assert_eq!(item, a);
        assert!(!needs_unlock);
    }

    #[test]
    fn single_locked_match_needs_unlock() {
        let b = path("/org/freedesktop/secrets/collection/login/2");
        let (item, needs_unlock) = select_item(Vec::new(), vec![b.clone()], &query()).unwrap();
        assert_eq!(item, b);
        assert!(needs_unlock);
    }

    #[test]
    fn locked_and_unlocked_matches_count_together() {
        let err = select_item(
            vec![path("/org/freedesktop/secrets/collection/login/1")],
            vec![path("/org/freedesktop/secrets/collection/login/2")],
            &query(),
        )
        .unwrap_err();
        assert!(matches!(err, CredentialError::Ambiguous { count: 2, .. }));
    }

    #[test]
    fn no_match_is_not_found() {
        let err = select_item(Vec::new(), Vec::new(), &query()).unwrap_err();
        assert!(
            matches!(err, CredentialError::NotFound { ref service } if service == "/home/u/.ssh/id_rsa")
        );
    }

    #[test]
    fn dismissed_prompt_is_unavailable() {
        assert!(prompt_outcome(false).is_ok());
        let err = prompt_outcome(true).unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable(ref m) if m.contains("dismissed")));
    }

    #[test]
    fn close_failure_keeps_read_result() {
        let ok = after_close(Ok(7), Err(zbus::Error::Failure("bus gone".to_string())));
        assert_eq!(ok.unwrap(), 7);

        let err = after_close::<u8>(
            Err(CredentialError::Unavailable("GetSecret: denied".to_string())),
            Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable(ref m) if m == "GetSecret: denied"));
    }

    #[test]
    fn unavailable_prefixes_the_operation() {
        let err = unavailable("SearchItems", "no such name");
        assert!(matches!(err, CredentialError::Unavailable(ref m) if m == "SearchItems: no such name"));
    }
}
