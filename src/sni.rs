//! Session-bus surface: the names and interfaces the daemon publishes,
//! the signals it emits, and the calls it makes back to icon publishers.
//!
//! The Watcher object is served by hand from the raw message stream (see
//! `app`): the registry contract pins the introspection document byte
//! for byte, serves only the scalar properties from `GetAll`, and must
//! accept method calls from publishers that omit the interface name.
//! None of that is expressible through the object-server macros, so this
//! module only provides the building blocks.

use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::message::{Flags, Type};
use zbus::zvariant::Value;
use zbus::{Connection, MatchRule, Message};

use crate::config::PROPERTY_CALL_TIMEOUT;
use crate::error::Error;
use crate::icon::PixmapTuple;

pub const WATCHER_NAME: &str = "org.kde.StatusNotifierWatcher";
pub const WATCHER_NAME_FDO: &str = "org.freedesktop.StatusNotifierWatcher";
pub const WATCHER_PATH: &str = "/StatusNotifierWatcher";
pub const WATCHER_IFACE: &str = "org.kde.StatusNotifierWatcher";
pub const ITEM_IFACE: &str = "org.kde.StatusNotifierItem";
pub const PROP_IFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECT_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const DEFAULT_ITEM_PATH: &str = "/StatusNotifierItem";

/// Served verbatim on Introspect. Current SNI publishers match against
/// this document, so it must not be regenerated or reformatted.
pub const INTROSPECT_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.kde.StatusNotifierWatcher">
    <method name="RegisterStatusNotifierItem">
      <arg direction="in" name="service" type="s"/>
    </method>
    <method name="RegisterStatusNotifierHost">
      <arg direction="in" name="service" type="s"/>
    </method>
    <property name="IsStatusNotifierHostRegistered" type="b" access="read"/>
    <property name="ProtocolVersion" type="i" access="read"/>
    <property name="RegisteredStatusNotifierItems" type="as" access="read"/>
    <signal name="StatusNotifierItemRegistered">
      <arg type="s"/>
    </signal>
    <signal name="StatusNotifierItemUnregistered">
      <arg type="s"/>
    </signal>
    <signal name="StatusNotifierHostRegistered"/>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg direction="in" name="interface" type="s"/>
      <arg direction="in" name="property" type="s"/>
      <arg direction="out" name="value" type="v"/>
    </method>
    <method name="GetAll">
      <arg direction="in" name="interface" type="s"/>
      <arg direction="out" name="properties" type="a{sv}"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg direction="out" name="xml" type="s"/>
    </method>
  </interface>
</node>
"#;

/// Claim the watcher names. The KDE name must end up primary-owned; the
/// freedesktop variant is advisory and its result is ignored.
pub async fn claim_names(conn: &Connection) -> Result<(), Error> {
    let reply = conn
        .request_name_with_flags(WATCHER_NAME, RequestNameFlags::ReplaceExisting.into())
        .await
        .map_err(|e| Error::Startup(format!("cannot request {WATCHER_NAME}: {e}")))?;
    if reply != RequestNameReply::PrimaryOwner {
        return Err(Error::Startup(format!(
            "could not become primary owner of {WATCHER_NAME}"
        )));
    }

    if let Err(e) = conn
        .request_name_with_flags(WATCHER_NAME_FDO, RequestNameFlags::ReplaceExisting.into())
        .await
    {
        log::debug!("{WATCHER_NAME_FDO} not claimed: {e}");
    }

    Ok(())
}

/// Subscribe to owner-loss notifications and icon refresh signals.
pub async fn add_signal_matches(conn: &Connection) -> Result<(), Error> {
    let bus = DBusProxy::new(conn)
        .await
        .map_err(|e| Error::Startup(format!("cannot reach message bus: {e}")))?;
    for (interface, member) in [
        ("org.freedesktop.DBus", "NameOwnerChanged"),
        (ITEM_IFACE, "NewIcon"),
    ] {
        let rule = MatchRule::builder()
            .msg_type(Type::Signal)
            .interface(interface)
            .map_err(zbus::Error::from)?
            .member(member)
            .map_err(zbus::Error::from)?
            .build();
        bus.add_match_rule(rule)
            .await
            .map_err(|e| Error::Startup(format!("cannot match {member}: {e}")))?;
    }
    Ok(())
}

/// RegisterStatusNotifierItem argument → (service, item path). A leading
/// '/' means the caller passed only a path and is itself the service; an
/// empty argument likewise falls back to the caller.
pub fn resolve_registration(arg: &str, sender: &str) -> (String, String) {
    if arg.starts_with('/') {
        (sender.to_owned(), arg.to_owned())
    } else if arg.is_empty() {
        (sender.to_owned(), DEFAULT_ITEM_PATH.to_owned())
    } else {
        (arg.to_owned(), DEFAULT_ITEM_PATH.to_owned())
    }
}

async fn emit_watcher_signal(conn: &Connection, member: &str, arg: Option<&str>) {
    let sent = async {
        let builder = Message::signal(WATCHER_PATH, WATCHER_IFACE, member)?;
        let msg = match arg {
            Some(arg) => builder.build(&arg)?,
            None => builder.build(&())?,
        };
        conn.send(&msg).await
    }
    .await;
    if let Err(e) = sent {
        log::warn!("failed to emit {member}: {e}");
    }
}

pub async fn emit_item_registered(conn: &Connection, full_name: &str) {
    emit_watcher_signal(conn, "StatusNotifierItemRegistered", Some(full_name)).await;
}

pub async fn emit_item_unregistered(conn: &Connection, full_name: &str) {
    emit_watcher_signal(conn, "StatusNotifierItemUnregistered", Some(full_name)).await;
}

pub async fn emit_host_registered(conn: &Connection) {
    emit_watcher_signal(conn, "StatusNotifierHostRegistered", None).await;
}

/// Invoke Activate / SecondaryActivate / ContextMenu on an item with
/// root coordinates. Fire and forget; the item may not even implement
/// the member.
pub async fn call_item_method(
    conn: &Connection,
    service: &str,
    path: &str,
    member: &str,
    x: i32,
    y: i32,
) {
    let sent = async {
        let msg = Message::method_call(path, member)?
            .destination(service)?
            .interface(ITEM_IFACE)?
            .with_flags(Flags::NoReplyExpected)?
            .build(&(x, y))?;
        conn.send(&msg).await
    }
    .await;
    if let Err(e) = sent {
        log::warn!("{member} on {service}{path} failed: {e}");
    }
}

/// Fetch the IconPixmap property, bounded by the configured call
/// timeout. Any failure (timeout, error reply, malformed variant)
/// yields `None` and leaves the caller's icon untouched.
pub async fn fetch_icon_pixmap(
    conn: &Connection,
    service: &str,
    path: &str,
) -> Option<Vec<PixmapTuple>> {
    let call = conn.call_method(
        Some(service),
        path,
        Some(PROP_IFACE),
        "Get",
        &(ITEM_IFACE, "IconPixmap"),
    );
    let reply = match tokio::time::timeout(PROPERTY_CALL_TIMEOUT, call).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            log::debug!("IconPixmap fetch from {service} failed: {e}");
            return None;
        }
        Err(_) => {
            log::debug!("IconPixmap fetch from {service} timed out");
            return None;
        }
    };
    let body = reply.body();
    let value: Value = match body.deserialize() {
        Ok(value) => value,
        Err(e) => {
            log::debug!("IconPixmap reply from {service} malformed: {e}");
            return None;
        }
    };
    Some(pixmap_tuples(&value))
}

/// Walk a variant expected to hold `a(iiay)`. Entries that do not have
/// that shape are skipped rather than failing the whole property.
pub fn pixmap_tuples(value: &Value) -> Vec<PixmapTuple> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.iter() {
        let Value::Structure(fields) = entry else {
            continue;
        };
        let fields = fields.fields();
        let (Some(Value::I32(w)), Some(Value::I32(h)), Some(Value::Array(bytes))) =
            (fields.first(), fields.get(1), fields.get(2))
        else {
            continue;
        };
        let data: Vec<u8> = bytes
            .iter()
            .map(|b| match b {
                Value::U8(b) => *b,
                _ => 0,
            })
            .collect();
        out.push((*w, *h, data));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_argument_takes_sender_as_service() {
        assert_eq!(
            resolve_registration("/StatusNotifierItem", ":1.42"),
            (":1.42".to_owned(), "/StatusNotifierItem".to_owned())
        );
        assert_eq!(
            resolve_registration("/org/custom/Item", ":1.7"),
            (":1.7".to_owned(), "/org/custom/Item".to_owned())
        );
    }

    #[test]
    fn unique_name_argument_gets_default_path() {
        assert_eq!(
            resolve_registration(":1.99", ":1.50"),
            (":1.99".to_owned(), "/StatusNotifierItem".to_owned())
        );
    }

    #[test]
    fn named_service_argument_is_kept() {
        assert_eq!(
            resolve_registration("org.example.Tray", ":1.5"),
            ("org.example.Tray".to_owned(), "/StatusNotifierItem".to_owned())
        );
    }

    #[test]
    fn empty_argument_falls_back_to_sender() {
        assert_eq!(
            resolve_registration("", ":1.3"),
            (":1.3".to_owned(), "/StatusNotifierItem".to_owned())
        );
    }

    #[test]
    fn introspection_document_is_stable() {
        assert!(INTROSPECT_XML.starts_with("<!DOCTYPE node"));
        assert!(INTROSPECT_XML.contains("<interface name=\"org.kde.StatusNotifierWatcher\">"));
        assert!(INTROSPECT_XML.contains("<signal name=\"StatusNotifierHostRegistered\"/>"));
        assert!(INTROSPECT_XML.ends_with("</node>\n"));
    }

    #[test]
    fn pixmap_tuples_decodes_well_formed_entries() {
        let value = Value::from(vec![
            (16i32, 16i32, vec![0u8; 16 * 16 * 4]),
            (32i32, 32i32, vec![0u8; 32 * 32 * 4]),
        ]);
        let tuples = pixmap_tuples(&value);
        assert_eq!(tuples.len(), 2);
        assert_eq!((tuples[0].0, tuples[0].1), (16, 16));
        assert_eq!(tuples[1].2.len(), 32 * 32 * 4);
    }

    #[test]
    fn pixmap_tuples_tolerates_wrong_shapes() {
        assert!(pixmap_tuples(&Value::from("not an array")).is_empty());
        assert!(pixmap_tuples(&Value::from(vec![1i32, 2, 3])).is_empty());
        assert!(pixmap_tuples(&Value::from(7u32)).is_empty());
    }
}
