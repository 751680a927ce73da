//! Textual patch description: a `Key: value` header, a format line, then
//! blank-line separated operation blocks of `key=value` lines.
//!
//! ```text
//! Product: game
//! Version: 1.1
//! Description: Fixes the save bug
//!
//! %DELTAPATCH 1.0 - Do not remove this line!
//!
//! PATCH FILE bin/game
//! oldsum=...
//! src=bin/game.0
//! newsum=...
//! mode=0755
//! size=123456
//! ```
//!
//! Payloads live in the `data/` directory next to the description file.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::{Error, Result, ResultExt};
use crate::ops::{AddFile, AddPath, DelFile, DelPath, DeltaOption, Patch, PatchFile, SymlinkFile};

pub const FORMAT_TAG: &str = "%DELTAPATCH 1.0";
pub const FORMAT_LINE: &str = "%DELTAPATCH 1.0 - Do not remove this line!";
pub const DATA_DIR: &str = "data";

/// Store directory belonging to the description file at `path`.
pub fn data_dir(path: &Path) -> PathBuf {
    path.parent().unwrap_or(Path::new(".")).join(DATA_DIR)
}

pub fn load(path: &Path) -> Result<Patch> {
    let text = fs::read_to_string(path).at(path)?;
    let patch = parse(&text, path, data_dir(path))?;
    log::debug!(
        "loaded {}: {} add-path, {} add-file, {} patch-file, {} symlink, {} del-file, {} del-path",
        path.display(),
        patch.add_path.len(),
        patch.add_file.len(),
        patch.patch_file.len(),
        patch.symlink_file.len(),
        patch.del_file.len(),
        patch.del_path.len()
    );
    Ok(patch)
}

pub fn save(patch: &Patch, path: &Path) -> Result<()> {
    fs::write(path, render(patch)).at(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    AddPath,
    AddFile,
    PatchFile,
    SymlinkFile,
    DelFile,
    DelPath,
}

const SECTIONS: [(&str, Section); 6] = [
    ("ADD PATH", Section::AddPath),
    ("ADD FILE", Section::AddFile),
    ("PATCH FILE", Section::PatchFile),
    ("SYMLINK FILE", Section::SymlinkFile),
    ("DEL FILE", Section::DelFile),
    ("DEL PATH", Section::DelPath),
];

/// Accepts `0755` (octal), `0x1ed` (hex) or plain decimal.
fn parse_mode(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if value.len() > 1 && value.starts_with('0') {
        u32::from_str_radix(&value[1..], 8).ok()
    } else {
        value.parse().ok()
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" => Some(true),
        "0" | "no" | "false" => Some(false),
        _ => None,
    }
}

/// Fields of the block currently being read.
struct Block {
    section: Section,
    dst: String,
    line: usize,
    src: Option<String>,
    sum: Option<Checksum>,
    mode: Option<u32>,
    size: Option<u64>,
    link: Option<String>,
    optional: bool,
    options: Vec<DeltaOption>,
    /// An option whose `oldsum` was seen but not yet its `newsum`.
    partial: Option<(Checksum, Option<String>)>,
}

impl Block {
    fn new(section: Section, dst: &str, line: usize) -> Self {
        Self {
            section,
            dst: dst.to_string(),
            line,
            src: None,
            sum: None,
            mode: None,
            size: None,
            link: None,
            optional: false,
            options: Vec::new(),
            partial: None,
        }
    }

    fn set(&mut self, key: &str, value: &str, path: &Path, line: usize) -> Result<()> {
        let bad = |what: &str| Error::parse(path, line, format!("invalid {what} `{value}`"));
        let checksum = |v: &str| v.parse::<Checksum>().map_err(|e| Error::parse(path, line, e));

        match (self.section, key) {
            (Section::AddPath | Section::AddFile | Section::PatchFile, "mode") => {
                self.mode = Some(parse_mode(value).ok_or_else(|| bad("mode"))?);
            }
            (Section::AddFile | Section::PatchFile, "size") => {
                self.size = Some(value.parse().map_err(|_| bad("size"))?);
            }
            (Section::AddFile, "src") => self.src = Some(value.to_string()),
            (Section::AddFile, "sum") => self.sum = Some(checksum(value)?),
            (Section::PatchFile, "oldsum") => {
                if self.partial.is_some() {
                    return Err(Error::parse(path, line, "oldsum before the previous option's newsum"));
                }
                self.partial = Some((checksum(value)?, None));
            }
            (Section::PatchFile, "src") => match &mut self.partial {
                Some((_, src @ None)) => *src = Some(value.to_string()),
                _ => return Err(Error::parse(path, line, "src must follow an oldsum")),
            },
            (Section::PatchFile, "newsum") => match self.partial.take() {
                Some((old_checksum, Some(src))) => self.options.push(DeltaOption {
                    old_checksum,
                    src,
                    new_checksum: checksum(value)?,
                    installed: false,
                }),
                _ => return Err(Error::parse(path, line, "newsum must follow oldsum and src")),
            },
            (Section::PatchFile, "optional") => {
                self.optional = parse_flag(value).ok_or_else(|| bad("optional flag"))?;
            }
            (Section::SymlinkFile, "link") => self.link = Some(value.to_string()),
            _ => {
                return Err(Error::parse(path, line, format!("unknown key `{key}` in this entry")));
            }
        }
        Ok(())
    }

    fn finish(self, patch: &mut Patch, path: &Path) -> Result<()> {
        let line = self.line;
        let missing = |what: &str| Error::parse(path, line, format!("incomplete entry for {}: no {what}", self.dst));

        match self.section {
            Section::AddPath => patch.add_path.push(AddPath {
                mode: self.mode.ok_or_else(|| missing("mode"))?,
                dst: self.dst,
                performed: false,
            }),
            Section::AddFile => patch.add_file.push(AddFile {
                checksum: self.sum.ok_or_else(|| missing("sum"))?,
                mode: self.mode.ok_or_else(|| missing("mode"))?,
                size: self.size.ok_or_else(|| missing("size"))?,
                src: self.src.unwrap_or_else(|| self.dst.clone()),
                dst: self.dst,
                performed: false,
            }),
            Section::PatchFile => {
                if self.partial.is_some() {
                    return Err(missing("newsum for the last option"));
                }
                if self.options.is_empty() {
                    return Err(missing("delta option"));
                }
                patch.patch_file.push(PatchFile {
                    mode: self.mode.ok_or_else(|| missing("mode"))?,
                    size: self.size.ok_or_else(|| missing("size"))?,
                    options: self.options,
                    optional: self.optional,
                    dst: self.dst,
                });
            }
            Section::SymlinkFile => patch.symlink_file.push(SymlinkFile {
                link: self.link.ok_or_else(|| missing("link"))?,
                dst: self.dst,
                performed: false,
            }),
            Section::DelFile => patch.del_file.push(DelFile { dst: self.dst }),
            Section::DelPath => patch.del_path.push(DelPath { dst: self.dst }),
        }
        Ok(())
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Parse description `text`; `path` is only used in error messages.
pub fn parse(text: &str, path: &Path, base: PathBuf) -> Result<Patch> {
    let mut patch = Patch {
        base,
        ..Default::default()
    };
    let mut product = None;
    let mut version = None;
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim_end()));
    let mut last_line = 0;

    // Header
    for (n, line) in lines.by_ref() {
        last_line = n;
        if line.is_empty() {
            break;
        }
        if is_comment(line) {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(path, n, "expected `Key: value`"))?;
        let value = value.trim().to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "product" => product = Some(value),
            "component" => patch.component = Some(value),
            "version" => version = Some(value),
            "description" => patch.description = value,
            "prepatch" => patch.prepatch = Some(value),
            "postpatch" => patch.postpatch = Some(value),
            "size" => {}
            _ => patch.fields.push((key.trim().to_string(), value)),
        }
    }
    patch.product = product.ok_or_else(|| Error::parse(path, last_line, "no Product in header"))?;
    patch.version = version.ok_or_else(|| Error::parse(path, last_line, "no Version in header"))?;

    // Format line
    let mut saw_format = false;
    for (n, line) in lines.by_ref() {
        last_line = n;
        if line.is_empty() || is_comment(line) {
            continue;
        }
        if !line.starts_with(FORMAT_TAG) {
            return Err(Error::parse(path, n, format!("expected `{FORMAT_TAG}` format line")));
        }
        saw_format = true;
        break;
    }
    if !saw_format {
        return Err(Error::parse(path, last_line, format!("missing `{FORMAT_TAG}` format line")));
    }

    // Operation blocks
    let mut block: Option<Block> = None;
    for (n, line) in lines {
        if is_comment(line) {
            continue;
        }
        if line.trim().is_empty() {
            if let Some(done) = block.take() {
                done.finish(&mut patch, path)?;
            }
            continue;
        }
        match &mut block {
            Some(current) => {
                let (key, value) = line
                    .split_once('=')
                    .ok_or_else(|| Error::parse(path, n, "expected `key=value`"))?;
                current.set(key.trim(), value.trim(), path, n)?;
            }
            None => {
                let (section, dst) = SECTIONS
                    .iter()
                    .find_map(|(tag, section)| {
                        line.strip_prefix(tag)
                            .filter(|rest| rest.starts_with(char::is_whitespace))
                            .map(|rest| (*section, rest.trim()))
                    })
                    .ok_or_else(|| Error::parse(path, n, format!("unknown section `{line}`")))?;
                if dst.is_empty() {
                    return Err(Error::parse(path, n, "section without a path"));
                }
                block = Some(Block::new(section, dst, n));
            }
        }
    }
    if let Some(done) = block {
        done.finish(&mut patch, path)?;
    }

    Ok(patch)
}

pub fn render(patch: &Patch) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Product: {}", patch.product);
    if let Some(component) = &patch.component {
        let _ = writeln!(out, "Component: {component}");
    }
    let _ = writeln!(out, "Version: {}", patch.version);
    let _ = writeln!(out, "Description: {}", patch.description);
    if let Some(cmd) = &patch.prepatch {
        let _ = writeln!(out, "Prepatch: {cmd}");
    }
    if let Some(cmd) = &patch.postpatch {
        let _ = writeln!(out, "Postpatch: {cmd}");
    }
    for (key, value) in &patch.fields {
        let _ = writeln!(out, "{key}: {value}");
    }
    let _ = writeln!(out, "# Diskspace required: {} K", patch.required_kib());
    let _ = writeln!(out);
    let _ = writeln!(out, "{FORMAT_LINE}");
    let _ = writeln!(out);

    for op in &patch.add_path {
        let _ = writeln!(out, "ADD PATH {}\nmode=0{:o}\n", op.dst, op.mode);
    }
    for op in &patch.add_file {
        let _ = writeln!(
            out,
            "ADD FILE {}\nsrc={}\nsum={}\nmode=0{:o}\nsize={}\n",
            op.dst, op.src, op.checksum, op.mode, op.size
        );
    }
    for op in &patch.patch_file {
        let _ = writeln!(out, "PATCH FILE {}", op.dst);
        for option in &op.options {
            let _ = writeln!(
                out,
                "oldsum={}\nsrc={}\nnewsum={}",
                option.old_checksum, option.src, option.new_checksum
            );
        }
        let _ = writeln!(out, "mode=0{:o}\nsize={}", op.mode, op.size);
        if op.optional {
            let _ = writeln!(out, "optional=yes");
        }
        let _ = writeln!(out);
    }
    for op in &patch.symlink_file {
        let _ = writeln!(out, "SYMLINK FILE {}\nlink={}\n", op.dst, op.link);
    }
    for op in &patch.del_file {
        let _ = writeln!(out, "DEL FILE {}\n", op.dst);
    }
    for op in &patch.del_path {
        let _ = writeln!(out, "DEL PATH {}\n", op.dst);
    }
    out
}
