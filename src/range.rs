/// A1-notation helpers for the handful of range shapes the engine issues:
/// a whole sheet (`Orders`), a single whole row (`Orders!1:1`) and a row
/// anchor (`Orders!A5`) that a write expands rightwards from.

/// Sheet names with anything but alphanumerics/underscore must be quoted,
/// with embedded quotes doubled.
pub fn quote_sheet(name: &str) -> String {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

pub fn whole_sheet(name: &str) -> String {
    quote_sheet(name)
}

pub fn header_row(name: &str) -> String {
    format!("{}!1:1", quote_sheet(name))
}

/// Anchor at column A of 1-based row `position`.
pub fn row_anchor(name: &str, position: u32) -> String {
    format!("{}!A{}", quote_sheet(name), position)
}

fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        index = index
            .checked_mul(26)?
            .checked_add(c as usize - 'A' as usize + 1)?;
    }
    Some(index - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeTarget {
    Sheet,
    /// A single whole row, 1-based.
    Row(u32),
    /// A start cell: 1-based row, 0-based column.
    Anchor { row: u32, column: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRange {
    pub sheet: String,
    pub target: RangeTarget,
}

/// Inverse of the formatters above. Returns `None` for shapes not issued here.
pub fn parse(a1: &str) -> Option<ParsedRange> {
    let (sheet_part, cell_part) = if a1.starts_with('\'') {
        let closing = a1[1..].find("'!").map(|i| i + 1);
        match closing {
            Some(end) => (&a1[..=end], Some(&a1[end + 2..])),
            None => (a1, None),
        }
    } else {
        match a1.rsplit_once('!') {
            Some((sheet, cells)) => (sheet, Some(cells)),
            None => (a1, None),
        }
    };

    let sheet = if sheet_part.len() >= 2 && sheet_part.starts_with('\'') && sheet_part.ends_with('\'') {
        sheet_part[1..sheet_part.len() - 1].replace("''", "'")
    } else {
        sheet_part.to_string()
    };
    if sheet.is_empty() {
        return None;
    }

    let target = match cell_part {
        None => RangeTarget::Sheet,
        Some(cells) => {
            if let Some((from, to)) = cells.split_once(':') {
                let from: u32 = from.parse().ok()?;
                let to: u32 = to.parse().ok()?;
                if from != to || from == 0 {
                    return None;
                }
                RangeTarget::Row(from)
            } else {
                let split = cells.find(|c: char| c.is_ascii_digit())?;
                let column = column_index(&cells[..split])?;
                let row: u32 = cells[split..].parse().ok()?;
                if row == 0 {
                    return None;
                }
                RangeTarget::Anchor { row, column }
            }
        }
    };

    Some(ParsedRange { sheet, target })
}
