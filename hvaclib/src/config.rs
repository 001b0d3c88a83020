//! Tab-separated configuration store with a runtime overlay.
//!
//! The primary file is the authoritative template and is never rewritten;
//! runtime mutations (setpoint changes) are written to a same-named
//! `.overlay` file holding only the dirty records. On load the primary is
//! parsed first and the overlay is applied on top, so tuned values survive
//! restarts without touching the template.
//!
//! Record grammar (one record per line, `#` starts a comment):
//!
//! ```text
//! BOARD <tag> <device> [DEBUG]
//! AI    <board> <index> <description> {420 <min> <max> | ICTD {C|F}}
//! DO    <board> <index> <description>
//! SP    <name> <value>
//! MAP   <map_name> <board> <index> <type>
//! ```
//!
//! Malformed lines are logged and skipped; a bad record never aborts a load.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ConfigError, Result};

/// Record type token, first field of every configuration line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PointType {
    /// Digital output on an IO board.
    Do,
    /// Analog input on an IO board.
    Ai,
    /// Setpoint consumed by the logic loop.
    Sp,
    /// IO board definition.
    Board,
    /// Globally unique name for a board point.
    Map,
}

impl PointType {
    /// Parses a record type token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "DO" => Some(Self::Do),
            "AI" => Some(Self::Ai),
            "SP" => Some(Self::Sp),
            "BOARD" => Some(Self::Board),
            "MAP" => Some(Self::Map),
            _ => None,
        }
    }

    /// The wire/file token for this type.
    pub fn token(self) -> &'static str {
        match self {
            Self::Do => "DO",
            Self::Ai => "AI",
            Self::Sp => "SP",
            Self::Board => "BOARD",
            Self::Map => "MAP",
        }
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Analog input subtype and its conversion parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum AiSubtype {
    /// 4-20 mA current loop scaled into `[min, max]`.
    CurrentLoop {
        /// Engineering value at 4 mA.
        min: i64,
        /// Engineering value at 20 mA.
        max: i64,
    },
    /// ICTD temperature probe.
    Ictd {
        /// Report Celsius when true, Fahrenheit otherwise.
        celsius: bool,
    },
}

/// An IO board definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDef {
    /// Unique short tag.
    pub tag: String,
    /// Serial device path or name (e.g. `ttyS0`).
    pub device: String,
    /// Extra per-board debug logging requested.
    pub debug: bool,
}

/// A DO or AI signal on a specific board.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardPoint {
    /// `PointType::Do` or `PointType::Ai`.
    pub kind: PointType,
    /// Owning board tag.
    pub board: String,
    /// Zero-based index on the board.
    pub index: u8,
    /// Human description.
    pub description: String,
    /// Conversion parameters, present for AI points.
    pub ai: Option<AiSubtype>,
}

impl fmt::Display for BoardPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.kind, self.board, self.index, self.description
        )
    }
}

/// A named, persistent tunable.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPoint {
    /// Setpoint name.
    pub name: String,
    /// Current value.
    pub value: f64,
}

impl fmt::Display for SetPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(SP,{},{})", self.name, self.value)
    }
}

/// One raw configuration record, preserved for overlay writing.
#[derive(Debug, Clone)]
struct ConfigEntry {
    kind: PointType,
    parts: Vec<String>,
    dirty: bool,
}

impl ConfigEntry {
    fn render(&self) -> String {
        let mut line = self.kind.token().to_string();
        for part in &self.parts {
            line.push('\t');
            line.push_str(part);
        }
        line
    }

    /// Identity key for overlay matching. SP/BOARD/MAP records are named
    /// by their first field; DO/AI records by board tag plus index.
    fn identity(&self) -> (PointType, String) {
        let first = self.parts.first().cloned().unwrap_or_default();
        match self.kind {
            PointType::Sp | PointType::Board | PointType::Map => (self.kind, first),
            PointType::Do | PointType::Ai => {
                let index = self.parts.get(1).cloned().unwrap_or_default();
                (self.kind, format!("{first}:{index}"))
            }
        }
    }
}

/// The parsed configuration plus its typed views.
///
/// Views are built once at load and are stable over the lifetime of the
/// store; mutation (`set_sp`) updates values in place and never
/// invalidates references handed out earlier.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    overlay_path: PathBuf,
    entries: Vec<ConfigEntry>,
    boards: Vec<BoardDef>,
    do_points: Vec<BoardPoint>,
    ai_points: Vec<BoardPoint>,
    sp_points: BTreeMap<String, SetPoint>,
    sp_entries: BTreeMap<String, usize>,
    point_map: BTreeMap<String, BoardPoint>,
}

impl ConfigStore {
    /// Loads the primary file and applies the overlay (created if absent).
    ///
    /// # Errors
    ///
    /// Fails when the primary file is unreadable or the overlay cannot be
    /// created. Individual malformed records are skipped, not fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let overlay_path = overlay_name(&path);

        let primary = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileAccess {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut store = Self {
            path,
            overlay_path,
            entries: Vec::new(),
            boards: Vec::new(),
            do_points: Vec::new(),
            ai_points: Vec::new(),
            sp_points: BTreeMap::new(),
            sp_entries: BTreeMap::new(),
            point_map: BTreeMap::new(),
        };

        for (line_no, line) in primary.lines().enumerate() {
            if let Some(entry) = parse_line(line, line_no) {
                store.entries.push(entry);
            }
        }

        store.apply_overlay()?;
        store.build_views();
        Ok(store)
    }

    /// Primary file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured boards.
    pub fn boards(&self) -> &[BoardDef] {
        &self.boards
    }

    /// Configured digital outputs.
    pub fn do_points(&self) -> &[BoardPoint] {
        &self.do_points
    }

    /// Configured analog inputs.
    pub fn ai_points(&self) -> &[BoardPoint] {
        &self.ai_points
    }

    /// Setpoints by name.
    pub fn sp_points(&self) -> &BTreeMap<String, SetPoint> {
        &self.sp_points
    }

    /// Map-name to board-point resolution.
    pub fn point_map(&self) -> &BTreeMap<String, BoardPoint> {
        &self.point_map
    }

    /// Current value of setpoint `name`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] for unknown names.
    pub fn sp_value(&self, name: &str) -> Result<f64> {
        self.sp_points
            .get(name)
            .map(|sp| sp.value)
            .ok_or_else(|| {
                ConfigError::NotFound {
                    kind: "SP",
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Updates setpoint `name` and marks its record dirty for the overlay.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] for unknown names.
    pub fn set_sp(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = *self.sp_entries.get(name).ok_or_else(|| ConfigError::NotFound {
            kind: "SP",
            name: name.to_string(),
        })?;

        let entry = &mut self.entries[idx];
        entry.parts[1] = format_float(value);
        entry.dirty = true;

        if let Some(sp) = self.sp_points.get_mut(name) {
            sp.value = value;
        }

        Ok(())
    }

    /// Writes every dirty record to the overlay file.
    ///
    /// # Errors
    ///
    /// Fails when the overlay cannot be written.
    pub fn save(&self) -> Result<()> {
        let mut out = String::new();
        out.push_str("#\n");
        out.push_str("# This file is mechanically generated.  Manual edits will be lost.\n");
        out.push_str("#\n");

        for entry in &self.entries {
            if entry.dirty {
                out.push_str(&entry.render());
                out.push('\n');
            }
        }

        out.push_str("# EOF\n");

        let mut file = std::fs::File::create(&self.overlay_path).map_err(|e| {
            ConfigError::FileAccess {
                path: self.overlay_path.display().to_string(),
                source: e,
            }
        })?;
        file.write_all(out.as_bytes()).map_err(|e| ConfigError::FileAccess {
            path: self.overlay_path.display().to_string(),
            source: e,
        })?;

        Ok(())
    }

    fn apply_overlay(&mut self) -> Result<()> {
        if !self.overlay_path.exists() {
            debug!(path = %self.overlay_path.display(), "creating empty overlay");
            std::fs::File::create(&self.overlay_path).map_err(|e| ConfigError::FileAccess {
                path: self.overlay_path.display().to_string(),
                source: e,
            })?;
            return Ok(());
        }

        let overlay =
            std::fs::read_to_string(&self.overlay_path).map_err(|e| ConfigError::FileAccess {
                path: self.overlay_path.display().to_string(),
                source: e,
            })?;

        for (line_no, line) in overlay.lines().enumerate() {
            let Some(mut incoming) = parse_line(line, line_no) else {
                continue;
            };
            incoming.dirty = true;

            match self
                .entries
                .iter_mut()
                .find(|e| e.identity() == incoming.identity())
            {
                Some(existing) => *existing = incoming,
                None => self.entries.push(incoming),
            }
        }

        Ok(())
    }

    fn build_views(&mut self) {
        for (idx, entry) in self.entries.iter().enumerate() {
            match entry.kind {
                PointType::Board => match parse_board(&entry.parts) {
                    Some(board) => self.boards.push(board),
                    None => warn!(record = %entry.render(), "skipping malformed BOARD record"),
                },
                PointType::Do => match parse_point(PointType::Do, &entry.parts) {
                    Some(point) => self.do_points.push(point),
                    None => warn!(record = %entry.render(), "skipping malformed DO record"),
                },
                PointType::Ai => match parse_point(PointType::Ai, &entry.parts) {
                    Some(point) => self.ai_points.push(point),
                    None => warn!(record = %entry.render(), "skipping malformed AI record"),
                },
                PointType::Sp => match parse_sp(&entry.parts) {
                    Some(sp) => {
                        self.sp_entries.insert(sp.name.clone(), idx);
                        self.sp_points.insert(sp.name.clone(), sp);
                    }
                    None => warn!(record = %entry.render(), "skipping malformed SP record"),
                },
                PointType::Map => {}
            }
        }

        // MAP records resolve against the DO/AI views, so a second pass.
        for entry in &self.entries {
            if entry.kind != PointType::Map {
                continue;
            }

            match self.resolve_map(&entry.parts) {
                Some((name, point)) => {
                    self.point_map.insert(name, point);
                }
                None => warn!(record = %entry.render(), "skipping unresolvable MAP record"),
            }
        }
    }

    fn resolve_map(&self, parts: &[String]) -> Option<(String, BoardPoint)> {
        if parts.len() < 4 {
            return None;
        }

        let name = parts[0].clone();
        let board = &parts[1];
        let index: u8 = parts[2].parse().ok()?;
        let kind = PointType::from_token(&parts[3])?;

        let pool = match kind {
            PointType::Do => &self.do_points,
            PointType::Ai => &self.ai_points,
            _ => return None,
        };

        let point = pool
            .iter()
            .find(|p| p.board == *board && p.index == index)?
            .clone();

        Some((name, point))
    }
}

fn overlay_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".overlay");
    PathBuf::from(name)
}

/// Formats a float the way setpoint records store them: no trailing zeros
/// beyond what the value needs.
fn format_float(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn parse_line(line: &str, line_no: usize) -> Option<ConfigEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields: Vec<String> = Vec::new();
    for field in line.split('\t') {
        if field.is_empty() {
            warn!(line = line_no, "zero-length field; possible double tab");
            continue;
        }
        fields.push(field.to_string());
    }

    let kind_token = fields.first()?;
    let Some(kind) = PointType::from_token(kind_token) else {
        warn!(line = line_no, token = %kind_token, "unknown record type");
        return None;
    };

    Some(ConfigEntry {
        kind,
        parts: fields[1..].to_vec(),
        dirty: false,
    })
}

fn parse_board(parts: &[String]) -> Option<BoardDef> {
    if parts.len() < 2 {
        return None;
    }

    Some(BoardDef {
        tag: parts[0].clone(),
        device: parts[1].clone(),
        debug: parts.get(2).is_some_and(|p| p == "DEBUG"),
    })
}

fn parse_point(kind: PointType, parts: &[String]) -> Option<BoardPoint> {
    if parts.len() < 3 {
        return None;
    }

    let board = parts[0].clone();
    let index: u8 = parts[1].parse().ok()?;
    let description = parts[2].clone();

    let ai = if kind == PointType::Ai {
        Some(parse_ai_subtype(&parts[3..])?)
    } else {
        None
    };

    Some(BoardPoint {
        kind,
        board,
        index,
        description,
        ai,
    })
}

fn parse_ai_subtype(parts: &[String]) -> Option<AiSubtype> {
    match parts.first().map(String::as_str) {
        Some("420") => {
            let min: i64 = parts.get(1)?.parse().ok()?;
            let max: i64 = parts.get(2)?.parse().ok()?;
            Some(AiSubtype::CurrentLoop { min, max })
        }
        Some("ICTD") => match parts.get(1).map(String::as_str) {
            Some("C") => Some(AiSubtype::Ictd { celsius: true }),
            Some("F") => Some(AiSubtype::Ictd { celsius: false }),
            _ => None,
        },
        _ => None,
    }
}

fn parse_sp(parts: &[String]) -> Option<SetPoint> {
    if parts.len() < 2 {
        return None;
    }

    Some(SetPoint {
        name: parts[0].clone(),
        value: parts[1].parse().ok()?,
    })
}
