//! Resolve / LightSpace XML frame decoder.
//!
//! Two schema variants arrive on the same port:
//!
//! *Standard*: values as child-element text:
//! ```xml
//! <calibration>
//!   <background><color><red>0</red><green>0</green><blue>0</blue><bits>10</bits></color></background>
//!   <rectangle>
//!     <color><red>940</red><green>64</green><blue>64</blue><bits>10</bits></color>
//!     <geometry><x>0.4</x><y>0.4</y><cx>0.2</cx><cy>0.2</cy></geometry>
//!   </rectangle>
//! </calibration>
//! ```
//!
//! *LightSpace*: the same data as attributes:
//! ```xml
//! <calibration>
//!   <background><color red="0" green="0" blue="0" bits="10"/></background>
//!   <rectangle>
//!     <color red="940" green="64" blue="64" bits="10"/>
//!     <geometry x="0.4" y="0.4" cx="0.2" cy="0.2"/>
//!   </rectangle>
//! </calibration>
//! ```
//!
//! Geometry is normalized [0,1] with a top-left origin; colors scale by the
//! declared bit depth (8 when `bits` is absent). Both variants decode to
//! the same list: background first (full field), then rectangles in
//! document order. Unknown elements are ignored; a rectangle with
//! unparseable values is skipped.

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use patgen_core::{Color, DrawCommand, Fill, Rect};

// ── Decoder scratch state ─────────────────────────────────────────────────────

#[derive(Default, Clone)]
struct ColorSpec {
    red: Option<f32>,
    green: Option<f32>,
    blue: Option<f32>,
    bits: Option<u8>,
}

impl ColorSpec {
    fn set(&mut self, field: &str, value: &str) {
        match field {
            "red" => self.red = value.trim().parse().ok(),
            "green" => self.green = value.trim().parse().ok(),
            "blue" => self.blue = value.trim().parse().ok(),
            "bits" => self.bits = value.trim().parse().ok(),
            _ => {}
        }
    }

    fn resolve(&self) -> Option<Color> {
        let bits = self.bits.unwrap_or(8);
        let scale = ((1u32 << bits) - 1) as f32;
        Some(Color::new(
            (self.red? / scale).clamp(0.0, 1.0),
            (self.green? / scale).clamp(0.0, 1.0),
            (self.blue? / scale).clamp(0.0, 1.0),
        ))
    }
}

#[derive(Default, Clone)]
struct GeometrySpec {
    x: Option<f32>,
    y: Option<f32>,
    cx: Option<f32>,
    cy: Option<f32>,
}

impl GeometrySpec {
    fn set(&mut self, field: &str, value: &str) {
        match field {
            "x" => self.x = value.trim().parse().ok(),
            "y" => self.y = value.trim().parse().ok(),
            "cx" => self.cx = value.trim().parse().ok(),
            "cy" => self.cy = value.trim().parse().ok(),
            _ => {}
        }
    }

    /// Top-left-origin [0,1] fractions → NDC rectangle.
    fn resolve(&self) -> Option<Rect> {
        let (x, y, cx, cy) = (self.x?, self.y?, self.cx?, self.cy?);
        Some(Rect {
            x: x * 2.0 - 1.0,
            y: 1.0 - (y + cy) * 2.0,
            width: cx * 2.0,
            height: cy * 2.0,
        })
    }
}

// ── decode_frame ──────────────────────────────────────────────────────────────

/// Decode one XML frame into a draw command list.
///
/// Fails only on malformed XML; content-level problems degrade to skipped
/// rectangles.
pub fn decode_frame(xml: &[u8]) -> anyhow::Result<Vec<DrawCommand>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut background: Option<Color> = None;
    let mut rectangles: Vec<DrawCommand> = Vec::new();

    let mut in_background = false;
    let mut in_rectangle = false;
    let mut rect_color = ColorSpec::default();
    let mut rect_geometry = GeometrySpec::default();
    // Innermost leaf element currently open, e.g. ("color", "red").
    let mut leaf: Option<(String, String)> = None;
    let mut open_section: Option<String> = None;

    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).context("parsing pattern XML")?;
        let empty = matches!(&event, Event::Empty(_));
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "background" => {
                        in_background = true;
                        rect_color = ColorSpec::default();
                    }
                    "rectangle" => {
                        in_rectangle = true;
                        rect_color = ColorSpec::default();
                        rect_geometry = GeometrySpec::default();
                    }
                    "color" if in_background || in_rectangle => {
                        // LightSpace puts the values on attributes.
                        apply_attributes(e, |field, value| rect_color.set(field, value));
                        if !empty {
                            open_section = Some("color".to_owned());
                        } else if in_background {
                            background = rect_color.resolve().or(background);
                        }
                    }
                    "geometry" if in_rectangle => {
                        apply_attributes(e, |field, value| rect_geometry.set(field, value));
                        if !empty {
                            open_section = Some("geometry".to_owned());
                        }
                    }
                    other => {
                        if let Some(section) = &open_section {
                            leaf = Some((section.clone(), other.to_owned()));
                        }
                    }
                }
            }

            Event::Text(ref t) => {
                if let Some((section, field)) = &leaf {
                    let value = String::from_utf8_lossy(t.as_ref()).to_string();
                    match section.as_str() {
                        "color" => rect_color.set(field, &value),
                        "geometry" => rect_geometry.set(field, &value),
                        _ => {}
                    }
                }
            }

            Event::End(ref e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "color" => {
                        open_section = None;
                        if in_background {
                            background = rect_color.resolve().or(background);
                        }
                    }
                    "geometry" => open_section = None,
                    "background" => in_background = false,
                    "rectangle" => {
                        in_rectangle = false;
                        match rect_color.resolve() {
                            Some(color) => {
                                let rect = rect_geometry.resolve().unwrap_or(Rect::FULL);
                                rectangles.push(DrawCommand { rect, fill: Fill::Solid(color) });
                            }
                            None => warn!("Skipping <rectangle> without a decodable color"),
                        }
                    }
                    _ => leaf = None,
                }
            }

            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let mut commands = Vec::with_capacity(rectangles.len() + 1);
    if let Some(bg) = background {
        commands.push(DrawCommand::full_field(bg));
    }
    commands.extend(rectangles);
    Ok(commands)
}

fn apply_attributes(element: &BytesStart<'_>, mut set: impl FnMut(&str, &str)) {
    for attr in element.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        if let Ok(value) = attr.unescape_value() {
            set(&key, &value);
        }
    }
}
