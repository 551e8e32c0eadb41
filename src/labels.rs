use image::Rgb;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

/// Fallback colours for classes without an explicit colour, indexed by class id.
const PALETTE: [[u8; 3]; 20] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [146, 204, 23],
    [61, 219, 134],
    [26, 147, 52],
    [0, 212, 187],
    [44, 153, 168],
    [0, 194, 255],
    [52, 69, 147],
    [100, 115, 255],
    [0, 24, 236],
    [132, 56, 255],
    [82, 0, 133],
    [203, 56, 255],
    [255, 149, 200],
    [255, 55, 199],
];

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line {line} in labels file: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("Invalid class names metadata: {0}")]
    InvalidMetadata(String),
    #[error("No class labels defined")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassLabel {
    pub name: String,
    pub color: Rgb<u8>,
}

/// Class id to name and colour lookup for one model.
#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    labels: Vec<ClassLabel>,
}

impl ClassLabels {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels = names
            .into_iter()
            .enumerate()
            .map(|(class_id, name)| ClassLabel {
                name: name.into(),
                color: palette_color(class_id),
            })
            .collect();
        Self { labels }
    }

    /// Reads `name` or `name,red,green,blue` lines; blank lines and `#` comments are skipped.
    pub fn load(filepath: &Path) -> Result<Self, LabelsError> {
        let file = File::open(filepath)?;
        let reader = io::BufReader::new(file);
        let mut labels = Vec::new();

        for (index, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            labels.push(parse_label_line(line, labels.len(), index + 1)?);
        }

        if labels.is_empty() {
            return Err(LabelsError::Empty);
        }

        Ok(Self { labels })
    }

    /// Parses the `names` entry exporters write into ONNX metadata, e.g.
    /// `{0: 'glioma', 1: 'meningioma'}`. Quoted names may contain commas.
    pub fn from_metadata(names: &str) -> Result<Self, LabelsError> {
        let body = names
            .trim()
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| LabelsError::InvalidMetadata(names.to_string()))?;

        let mut entries = parse_names_dict(body)?;

        if entries.is_empty() {
            return Err(LabelsError::Empty);
        }
        entries.sort_by_key(|(id, _)| *id);
        if entries.iter().enumerate().any(|(i, (id, _))| i != *id) {
            return Err(LabelsError::InvalidMetadata(
                "class ids are not contiguous from 0".to_string(),
            ));
        }

        Ok(Self::from_names(entries.into_iter().map(|(_, name)| name)))
    }

    pub fn get(&self, class_id: usize) -> Option<&ClassLabel> {
        self.labels.get(class_id)
    }

    pub fn name(&self, class_id: usize) -> String {
        match self.get(class_id) {
            Some(label) => label.name.clone(),
            None => format!("class {}", class_id),
        }
    }

    pub fn color(&self, class_id: usize) -> Rgb<u8> {
        self.get(class_id)
            .map(|label| label.color)
            .unwrap_or_else(|| palette_color(class_id))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub fn palette_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

/// Splits `0: 'a', 1: "b's", 2: c` into `(id, name)` pairs.
fn parse_names_dict(body: &str) -> Result<Vec<(usize, String)>, LabelsError> {
    let invalid = || LabelsError::InvalidMetadata(body.to_string());
    let mut entries = Vec::new();
    let mut rest = body.trim_start();

    while !rest.is_empty() {
        let (id, tail) = rest.split_once(':').ok_or_else(invalid)?;
        let id: usize = id.trim().parse().map_err(|_| invalid())?;
        let tail = tail.trim_start();

        let (name, tail) = match tail.chars().next() {
            Some(quote @ ('\'' | '"')) => {
                let end = tail[1..].find(quote).ok_or_else(invalid)?;
                (&tail[1..end + 1], &tail[end + 2..])
            }
            _ => tail.split_once(',').unwrap_or((tail, "")),
        };
        entries.push((id, name.trim().to_string()));

        let tail = tail.trim_start();
        rest = tail.strip_prefix(',').unwrap_or(tail).trim_start();
    }

    Ok(entries)
}

fn parse_label_line(line: &str, class_id: usize, line_no: usize) -> Result<ClassLabel, LabelsError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    let invalid = |reason: &str| LabelsError::InvalidLine {
        line: line_no,
        reason: reason.to_string(),
    };

    match parts.as_slice() {
        [name] if !name.is_empty() => Ok(ClassLabel {
            name: name.to_string(),
            color: palette_color(class_id),
        }),
        [name, red, green, blue] if !name.is_empty() => {
            let channel = |value: &str, channel: &str| {
                value
                    .parse::<u8>()
                    .map_err(|_| invalid(&format!("invalid {} value {:?}", channel, value)))
            };
            Ok(ClassLabel {
                name: name.to_string(),
                color: Rgb([
                    channel(*red, "red")?,
                    channel(*green, "green")?,
                    channel(*blue, "blue")?,
                ]),
            })
        }
        _ => Err(invalid(&format!("expected `name` or `name,r,g,b`, got {:?}", line))),
    }
}
