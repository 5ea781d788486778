//! The bridge core: one cooperative loop multiplexing the display
//! connection and the session bus.
//!
//! Per tick: drain display events, drain pending bus messages, wait on
//! both descriptors (bounded by the tick timeout), then poll the tray
//! selection owner and redock if it moved. Method handlers, signal
//! reactions, painting and redocking all run on this one thread.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::Signal;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{ButtonPressEvent, Window};
use zbus::message::Type;
use zbus::zvariant::Value;
use zbus::{Connection, Message, MessageStream};

use crate::catalogue::Catalogue;
use crate::config::{ICON_SIZE, REDOCK_DELAY_MS, TICK_TIMEOUT};
use crate::error::{CatalogueError, Error};
use crate::icon;
use crate::sni;
use crate::x11::DisplayContext;

enum Wake {
    Display,
    Bus(Option<zbus::Result<Message>>),
    Tick,
    Shutdown,
}

pub struct App {
    display: DisplayContext,
    bus: Connection,
    stream: MessageStream,
    catalogue: Catalogue,
    previous_tray: Option<Window>,
    sigint: Signal,
    sigterm: Signal,
    running: bool,
}

impl App {
    pub fn new(
        display: DisplayContext,
        bus: Connection,
        stream: MessageStream,
        sigint: Signal,
        sigterm: Signal,
    ) -> Result<Self, Error> {
        let previous_tray = display.tray_owner()?;
        Ok(App {
            display,
            bus,
            stream,
            catalogue: Catalogue::new(),
            previous_tray,
            sigint,
            sigterm,
            running: true,
        })
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        let display_fd = AsyncFd::with_interest(self.display.raw_fd(), Interest::READABLE)
            .map_err(|e| Error::Startup(format!("cannot watch display fd: {e}")))?;

        while self.running {
            self.drain_display().await;
            self.drain_bus().await;
            self.display.flush();

            let wake = tokio::select! {
                guard = display_fd.readable() => {
                    if let Ok(mut guard) = guard {
                        guard.clear_ready();
                    }
                    Wake::Display
                }
                item = self.stream.next() => Wake::Bus(item),
                _ = tokio::time::sleep(TICK_TIMEOUT) => Wake::Tick,
                _ = self.sigint.recv() => Wake::Shutdown,
                _ = self.sigterm.recv() => Wake::Shutdown,
            };

            self.poll_tray().await;

            match wake {
                Wake::Bus(item) => self.handle_bus_item(item).await,
                Wake::Shutdown => {
                    log::info!("shutdown signal received");
                    self.running = false;
                }
                Wake::Display | Wake::Tick => {}
            }
        }
        Ok(())
    }

    /// Release every icon's resources (pixmap, then gc, then window) and
    /// let the connections drop.
    pub fn cleanup(mut self) {
        for mut icon in self.catalogue.drain() {
            self.display.release_icon(&mut icon);
        }
        self.display.flush();
        log::info!("shut down cleanly");
    }

    fn fatal_display(&mut self, err: &Error) {
        if matches!(err, Error::Display(_)) {
            log::error!("{err}");
            self.running = false;
        } else {
            log::warn!("{err}");
        }
    }

    // ---- display side ----

    async fn drain_display(&mut self) {
        loop {
            match self.display.poll_event() {
                Ok(Some(event)) => self.handle_display_event(event).await,
                Ok(None) => break,
                Err(e) => {
                    log::error!("display connection lost: {e}");
                    self.running = false;
                    break;
                }
            }
        }
    }

    async fn handle_display_event(&mut self, event: Event) {
        match event {
            // Typically a request against a window the old tray already
            // tore down; harmless.
            Event::Error(e) => log::debug!("display error event: {e:?}"),
            Event::Expose(ev) if ev.count == 0 => {
                if let Some(icon) = self.catalogue.find_by_window(ev.window) {
                    self.display.paint(icon);
                }
            }
            Event::ButtonPress(ev) => self.handle_button_press(ev).await,
            _ => {}
        }
    }

    async fn handle_button_press(&mut self, ev: ButtonPressEvent) {
        let Some((service, path)) = self
            .catalogue
            .find_by_window(ev.event)
            .map(|icon| (icon.service.clone(), icon.path.clone()))
        else {
            return;
        };
        let (x, y) = match self.display.window_to_root(ev.event, ev.event_x, ev.event_y) {
            Ok(Some(pos)) => pos,
            Ok(None) => return,
            Err(e) => {
                log::error!("display connection lost: {e}");
                self.running = false;
                return;
            }
        };
        let member = match ev.detail {
            1 => "Activate",
            2 => "SecondaryActivate",
            3 => "ContextMenu",
            _ => return,
        };
        log::debug!("button {} on {service} -> {member}", ev.detail);
        sni::call_item_method(&self.bus, &service, &path, member, x.into(), y.into()).await;
    }

    // ---- tray binding ----

    async fn poll_tray(&mut self) {
        let current = match self.display.tray_owner() {
            Ok(current) => current,
            Err(e) => {
                log::error!("display connection lost: {e}");
                self.running = false;
                return;
            }
        };
        if current == self.previous_tray {
            return;
        }
        match current {
            None => {
                // Tray gone: hide the windows immediately so the next
                // window manager does not start managing them.
                log::info!("tray owner gone, hiding icons");
                for icon in self.catalogue.iter() {
                    if let Some(surface) = icon.surface {
                        self.display.unmap(surface.window);
                    }
                }
                self.display.flush();
                self.previous_tray = None;
            }
            Some(tray) => {
                self.redock_all(tray).await;
                self.previous_tray = Some(tray);
            }
        }
    }

    async fn redock_all(&mut self, tray: Window) {
        log::info!("tray owner changed, redocking {} icons", self.catalogue.iter().count());
        // Let the new tray finish setting up its selection machinery.
        tokio::time::sleep(Duration::from_millis(REDOCK_DELAY_MS)).await;

        let services: Vec<String> = self
            .catalogue
            .iter()
            .map(|icon| icon.service.clone())
            .collect();
        for service in services {
            // Old window and gc go first; the pixmap stays alive until
            // the replacement window is docked.
            if let Some(icon) = self.catalogue.find_by_service(&service) {
                if let Some(old) = icon.surface.take() {
                    self.display.free_surface(old);
                }
            }
            let surface = match self.display.create_icon_window() {
                Ok(surface) => surface,
                Err(e) => {
                    self.fatal_display(&e);
                    continue;
                }
            };
            if let Err(e) = self.display.send_dock_request(tray, surface.window) {
                self.fatal_display(&e);
            }
            if let Some(icon) = self.catalogue.find_by_service(&service) {
                icon.surface = Some(surface);
                if let Some(old) = icon.pixmap.take() {
                    self.display.free_pixmap(old);
                }
            }
            self.refresh_icon(&service).await;
        }
        self.display.flush();
    }

    // ---- bus side ----

    async fn drain_bus(&mut self) {
        while let Some(item) = self.stream.next().now_or_never() {
            self.handle_bus_item(item).await;
            if !self.running {
                break;
            }
        }
    }

    async fn handle_bus_item(&mut self, item: Option<zbus::Result<Message>>) {
        match item {
            None => {
                log::error!("session bus connection closed");
                self.running = false;
            }
            Some(Err(e)) => log::warn!("bus receive error: {e}"),
            Some(Ok(msg)) => self.dispatch_message(&msg).await,
        }
    }

    async fn dispatch_message(&mut self, msg: &Message) {
        match msg.header().message_type() {
            Type::MethodCall => self.handle_method_call(msg).await,
            Type::Signal => self.handle_signal(msg).await,
            _ => {}
        }
    }

    /// Route by interface and member. Some icon publishers omit the
    /// interface name on their method calls; a recognised member alone
    /// is accepted for those.
    async fn handle_method_call(&mut self, msg: &Message) {
        let header = msg.header();
        if header.path().map(|p| p.as_str()) != Some(sni::WATCHER_PATH) {
            return;
        }
        let interface = header.interface().map(|i| i.as_str());
        let member = header.member().map(|m| m.as_str()).unwrap_or("");
        match (interface, member) {
            (Some(sni::WATCHER_IFACE) | None, "RegisterStatusNotifierItem") => {
                self.register_item(msg).await;
            }
            (Some(sni::WATCHER_IFACE) | None, "RegisterStatusNotifierHost") => {
                self.register_host(msg).await;
            }
            (Some(sni::PROP_IFACE) | None, "Get") => self.property_get(msg).await,
            (Some(sni::PROP_IFACE) | None, "GetAll") => self.property_get_all(msg).await,
            (Some(sni::INTROSPECT_IFACE) | None, "Introspect") => {
                self.send_reply(
                    msg,
                    Message::method_return(&msg.header())
                        .and_then(|b| b.build(&sni::INTROSPECT_XML)),
                )
                .await;
            }
            _ => {}
        }
    }

    async fn handle_signal(&mut self, msg: &Message) {
        let header = msg.header();
        let interface = header.interface().map(|i| i.as_str());
        let member = header.member().map(|m| m.as_str());
        match (interface, member) {
            (Some("org.freedesktop.DBus"), Some("NameOwnerChanged")) => {
                if let Ok((name, _old, new_owner)) =
                    msg.body().deserialize::<(String, String, String)>()
                {
                    if new_owner.is_empty() {
                        self.remove_item(&name).await;
                    }
                }
            }
            (Some(sni::ITEM_IFACE), Some("NewIcon")) => {
                let Some(sender) = header.sender().map(|s| s.as_str().to_owned()) else {
                    return;
                };
                if self.catalogue.find_by_service(&sender).is_some() {
                    self.refresh_icon(&sender).await;
                }
            }
            _ => {}
        }
    }

    async fn register_item(&mut self, msg: &Message) {
        let sender = msg
            .header()
            .sender()
            .map(|s| s.as_str().to_owned())
            .unwrap_or_default();
        let arg: String = msg.body().deserialize().unwrap_or_default();
        let (service, path) = sni::resolve_registration(&arg, &sender);
        let registered = self.add_item(&service, &path).await;
        self.send_reply(msg, Message::method_return(&msg.header()).and_then(|b| b.build(&())))
            .await;
        if registered {
            sni::emit_item_registered(&self.bus, &format!("{service}{path}")).await;
        }
    }

    async fn register_host(&mut self, msg: &Message) {
        self.send_reply(msg, Message::method_return(&msg.header()).and_then(|b| b.build(&())))
            .await;
        sni::emit_host_registered(&self.bus).await;
    }

    async fn property_get(&mut self, msg: &Message) {
        let (_iface, prop): (String, String) = msg.body().deserialize().unwrap_or_default();
        let value = match prop.as_str() {
            "IsStatusNotifierHostRegistered" => Some(Value::from(true)),
            "ProtocolVersion" => Some(Value::from(0i32)),
            "RegisteredStatusNotifierItems" => {
                Some(Value::from(self.catalogue.registered_names()))
            }
            _ => None,
        };
        let built = match value {
            Some(value) => {
                Message::method_return(&msg.header()).and_then(|b| b.build(&value))
            }
            None => Message::error(&msg.header(), "org.freedesktop.DBus.Error.UnknownProperty")
                .and_then(|b| b.build(&"Unknown property")),
        };
        self.send_reply(msg, built).await;
    }

    /// Only the scalar properties; the item list is served through Get.
    async fn property_get_all(&mut self, msg: &Message) {
        let mut props: HashMap<&str, Value> = HashMap::new();
        props.insert("IsStatusNotifierHostRegistered", Value::from(true));
        props.insert("ProtocolVersion", Value::from(0i32));
        self.send_reply(
            msg,
            Message::method_return(&msg.header()).and_then(|b| b.build(&props)),
        )
        .await;
    }

    async fn send_reply(&self, msg: &Message, built: zbus::Result<Message>) {
        let sent = match built {
            Ok(reply) => self.bus.send(&reply).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            let member = msg.header().member().map(|m| m.as_str().to_owned());
            log::warn!("reply to {member:?} failed: {e}");
        }
    }

    // ---- icon lifecycle ----

    /// Returns whether the service was actually added; duplicates and a
    /// full catalogue are refused without failing the method call.
    async fn add_item(&mut self, service: &str, path: &str) -> bool {
        match self.catalogue.insert(service, path) {
            Err(CatalogueError::AlreadyPresent) => return false,
            Err(CatalogueError::CapacityExceeded) => {
                log::warn!("registration of {service} refused: catalogue is full");
                return false;
            }
            Ok(_) => {}
        }
        log::info!("registered {service}{path}");

        match self.display.create_icon_window() {
            Ok(surface) => {
                if let Some(icon) = self.catalogue.find_by_service(service) {
                    icon.surface = Some(surface);
                }
                match self.display.tray_owner() {
                    Ok(Some(tray)) => {
                        if let Err(e) = self.display.send_dock_request(tray, surface.window) {
                            self.fatal_display(&e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.fatal_display(&Error::Display(e)),
                }
            }
            Err(e) => self.fatal_display(&e),
        }

        self.refresh_icon(service).await;
        true
    }

    async fn remove_item(&mut self, service: &str) {
        let Some(mut icon) = self.catalogue.remove(service) else {
            return;
        };
        log::info!("unregistered {}", icon.full_name());
        sni::emit_item_unregistered(&self.bus, &icon.full_name()).await;
        self.display.release_icon(&mut icon);
        self.display.flush();
    }

    /// Fetch the item's pixmap property, scale it into a fresh
    /// server-side pixmap and repaint. Any failure leaves the icon as it
    /// was.
    async fn refresh_icon(&mut self, service: &str) {
        let Some((path, surface)) = self
            .catalogue
            .find_by_service(service)
            .map(|icon| (icon.path.clone(), icon.surface))
        else {
            return;
        };
        let Some(surface) = surface else { return };

        let Some(tuples) = sni::fetch_icon_pixmap(&self.bus, service, &path).await else {
            return;
        };
        let Some(best) = icon::select_pixmap(&tuples, ICON_SIZE) else {
            return;
        };
        let (Ok(src_w), Ok(src_h)) = (u16::try_from(best.0), u16::try_from(best.1)) else {
            return;
        };
        let (w, h) = icon::target_dims(best.0, best.1, ICON_SIZE);
        let bgrx = icon::scale_to_bgrx(&best.2, src_w, src_h, w, h);

        if let Some(icon) = self.catalogue.find_by_service(service) {
            if let Some(old) = icon.pixmap.take() {
                self.display.free_pixmap(old);
            }
        }
        match self.display.upload_pixmap(surface, w, h, &bgrx) {
            Ok(px) => {
                if let Some(icon) = self.catalogue.find_by_service(service) {
                    icon.pixmap = Some(px);
                    self.display.paint(icon);
                }
            }
            Err(e) => self.fatal_display(&e),
        }
    }
}
