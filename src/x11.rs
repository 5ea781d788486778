//! Display-server side: connection ownership, the tray atoms, icon
//! window and pixmap lifecycles, docking messages, and painting.
//!
//! Request-level errors on windows that a tray teardown already
//! destroyed are expected during redocking; they surface either as
//! `Event::Error` in the event queue (ignored by the loop) or as reply
//! errors mapped to `None` here. Only a broken connection is fatal.

use std::os::unix::io::{AsRawFd, RawFd};

use x11rb::connection::Connection;
use x11rb::errors::{ConnectionError, ReplyError};
use x11rb::protocol::Event;
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;

use crate::catalogue::{Icon, ScaledPixmap, Surface};
use crate::config::{BG_COLOR, ICON_SIZE};
use crate::error::Error;

pub const SYSTEM_TRAY_REQUEST_DOCK: u32 = 0;

struct Atoms {
    tray_selection: Atom,
    tray_opcode: Atom,
}

pub struct DisplayContext {
    conn: RustConnection,
    root: Window,
    depth: u8,
    visual: Visualid,
    bg_pixel: u32,
    atoms: Atoms,
}

fn intern_atom(conn: &RustConnection, name: &str) -> Result<Atom, Error> {
    Ok(conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
}

/// "#rrggbb" → 16-bit-per-channel components, the scaling AllocColor
/// expects.
fn parse_hex_color(spec: &str) -> Option<(u16, u16, u16)> {
    let hex = spec.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some((
        u16::from(channel(0)?) * 257,
        u16::from(channel(2)?) * 257,
        u16::from(channel(4)?) * 257,
    ))
}

impl DisplayContext {
    /// Open the display and prepare everything the icon windows share:
    /// the tray atoms and the allocated background pixel.
    pub fn connect() -> Result<Self, Error> {
        let (conn, screen_num) = x11rb::connect(None)?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let depth = screen.root_depth;
        let visual = screen.root_visual;
        let colormap = screen.default_colormap;

        let atoms = Atoms {
            tray_selection: intern_atom(&conn, &format!("_NET_SYSTEM_TRAY_S{screen_num}"))?,
            tray_opcode: intern_atom(&conn, "_NET_SYSTEM_TRAY_OPCODE")?,
        };

        let bg_pixel = match parse_hex_color(BG_COLOR) {
            Some((r, g, b)) => conn.alloc_color(colormap, r, g, b)?.reply()?.pixel,
            None => {
                conn.alloc_named_color(colormap, BG_COLOR.as_bytes())?
                    .reply()?
                    .pixel
            }
        };

        log::info!("display open: screen {screen_num}, depth {depth}");
        Ok(DisplayContext {
            conn,
            root,
            depth,
            visual,
            bg_pixel,
            atoms,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.conn.stream().as_raw_fd()
    }

    pub fn poll_event(&self) -> Result<Option<Event>, ConnectionError> {
        self.conn.poll_for_event()
    }

    pub fn flush(&self) {
        let _ = self.conn.flush();
    }

    /// Current owner of the tray selection, `None` when no tray is
    /// running (or the query raced a dying one).
    pub fn tray_owner(&self) -> Result<Option<Window>, ConnectionError> {
        match self.conn.get_selection_owner(self.atoms.tray_selection) {
            Ok(cookie) => match cookie.reply() {
                Ok(reply) if reply.owner != x11rb::NONE => Ok(Some(reply.owner)),
                Ok(_) => Ok(None),
                Err(ReplyError::ConnectionError(e)) => Err(e),
                Err(ReplyError::X11Error(e)) => {
                    log::debug!("selection owner query failed: {e:?}");
                    Ok(None)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// A tray icon window: root child, fixed square, button and exposure
    /// events selected, with a GC bound to it.
    pub fn create_icon_window(&self) -> Result<Surface, Error> {
        let window = self.conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .background_pixel(self.bg_pixel)
            .event_mask(EventMask::BUTTON_PRESS | EventMask::BUTTON_RELEASE | EventMask::EXPOSURE);
        self.conn.create_window(
            self.depth,
            window,
            self.root,
            0,
            0,
            ICON_SIZE,
            ICON_SIZE,
            0,
            WindowClass::INPUT_OUTPUT,
            self.visual,
            &aux,
        )?;

        let gc = self.conn.generate_id()?;
        self.conn
            .create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0u32))?;

        Ok(Surface { window, gc })
    }

    /// Ask the tray owner to embed the window: opcode message first, map
    /// second, then flush so both leave together.
    pub fn send_dock_request(&self, tray: Window, window: Window) -> Result<(), Error> {
        let msg = ClientMessageEvent {
            response_type: CLIENT_MESSAGE_EVENT,
            format: 32,
            sequence: 0,
            window: tray,
            type_: self.atoms.tray_opcode,
            data: ClientMessageData::from([
                x11rb::CURRENT_TIME,
                SYSTEM_TRAY_REQUEST_DOCK,
                window,
                0,
                0,
            ]),
        };
        self.conn.send_event(false, tray, EventMask::NO_EVENT, msg)?;
        self.conn.map_window(window)?;
        self.conn.flush()?;
        Ok(())
    }

    /// Store the scaled BGRX image into a fresh server-side pixmap.
    pub fn upload_pixmap(
        &self,
        surface: Surface,
        width: u16,
        height: u16,
        bgrx: &[u8],
    ) -> Result<ScaledPixmap, Error> {
        let pixmap = self.conn.generate_id()?;
        self.conn
            .create_pixmap(self.depth, pixmap, self.root, width, height)?;
        self.conn.put_image(
            ImageFormat::Z_PIXMAP,
            pixmap,
            surface.gc,
            width,
            height,
            0,
            0,
            0,
            self.depth,
            bgrx,
        )?;
        Ok(ScaledPixmap {
            pixmap,
            width,
            height,
        })
    }

    /// Clear the window and blit the pixmap centred in the icon square.
    pub fn paint(&self, icon: &Icon) {
        let (Some(surface), Some(px)) = (icon.surface, icon.pixmap) else {
            return;
        };
        let centre = |extent: u16| (i32::from(ICON_SIZE) - i32::from(extent)).max(0) as i16 / 2;
        let _ = self.conn.clear_area(false, surface.window, 0, 0, 0, 0);
        let _ = self.conn.copy_area(
            px.pixmap,
            surface.window,
            surface.gc,
            0,
            0,
            centre(px.width),
            centre(px.height),
            px.width,
            px.height,
        );
        self.flush();
    }

    pub fn unmap(&self, window: Window) {
        let _ = self.conn.unmap_window(window);
    }

    /// Event coordinates on an icon window → root coordinates. `None`
    /// when the window vanished under us.
    pub fn window_to_root(
        &self,
        window: Window,
        x: i16,
        y: i16,
    ) -> Result<Option<(i16, i16)>, ConnectionError> {
        match self.conn.translate_coordinates(window, self.root, x, y) {
            Ok(cookie) => match cookie.reply() {
                Ok(reply) => Ok(Some((reply.dst_x, reply.dst_y))),
                Err(ReplyError::ConnectionError(e)) => Err(e),
                Err(ReplyError::X11Error(e)) => {
                    log::debug!("coordinate translation failed: {e:?}");
                    Ok(None)
                }
            },
            Err(e) => Err(e),
        }
    }

    pub fn free_pixmap(&self, px: ScaledPixmap) {
        let _ = self.conn.free_pixmap(px.pixmap);
    }

    /// Free a graphics context and destroy its window. During a redock
    /// this runs while the icon's pixmap is still alive; the pixmap is
    /// retired separately once the replacement window is up.
    pub fn free_surface(&self, surface: Surface) {
        let _ = self.conn.free_gc(surface.gc);
        let _ = self.conn.destroy_window(surface.window);
    }

    /// Release everything an icon owns: pixmap, then graphics context,
    /// then window.
    pub fn release_icon(&self, icon: &mut Icon) {
        if let Some(px) = icon.pixmap.take() {
            self.free_pixmap(px);
        }
        if let Some(surface) = icon.surface.take() {
            self.free_surface(surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_hex_color;

    #[test]
    fn parses_rgb_hex_spec() {
        assert_eq!(
            parse_hex_color("#222222"),
            Some((0x22 * 257, 0x22 * 257, 0x22 * 257))
        );
        assert_eq!(parse_hex_color("#ff0080"), Some((0xffff, 0, 0x80 * 257)));
    }

    #[test]
    fn rejects_named_and_malformed_specs() {
        assert_eq!(parse_hex_color("steel blue"), None);
        assert_eq!(parse_hex_color("#fff"), None);
        assert_eq!(parse_hex_color("#zzzzzz"), None);
    }
}
