// Module for loading and writing the parquet tables passed between stages. Reads play-by-play and
// team-week files, validates key columns, and keeps only numeric value columns.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parquet::basic::{ConvertedType, Repetition, Type as PhysicalType};
use parquet::data_type::{ByteArray, ByteArrayType, DataType, DoubleType, Int32Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::{SerializedFileWriter, SerializedRowGroupWriter};
use parquet::record::Field;
use parquet::schema::types::Type;

use crate::error::{PipelineError, Result};

const PLAY_KEYS: [&str; 5] = ["game_id", "season", "week", "home_team", "away_team"];
const TEAM_WEEK_KEYS: [&str; 3] = ["season", "week", "team"];
const FEATURE_KEYS: [&str; 6] = ["season", "week", "game_id", "home_team", "away_team", "result"];

/// One play: the game it belongs to plus every numeric column of the play table.
#[derive(Debug, Clone, PartialEq)]
pub struct Play {
    pub game: Matchup,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayTable {
    pub columns: Vec<String>,
    pub plays: Vec<Play>,
}

impl PlayTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeamWeek {
    pub season: i32,
    pub week: i32,
    pub team: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeamWeekTable {
    pub columns: Vec<String>,
    pub rows: Vec<TeamWeek>,
}

/// A scheduled game.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Matchup {
    pub game_id: String,
    pub season: i32,
    pub week: i32,
    pub home_team: String,
    pub away_team: String,
}

/// One labelled matchup row of the feature table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub matchup: Matchup,
    pub result: i32,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `name` in `row`, `None` when the column is absent or null.
    pub fn value(&self, row: &FeatureRow, name: &str) -> Option<f64> {
        self.column_index(name)
            .and_then(|idx| row.values.get(idx).copied().flatten())
    }
}

/// Rows read from one or more parquet files sharing a set of key columns.
struct KeyedRows<K> {
    columns: Vec<String>,
    rows: Vec<(K, Vec<Option<f64>>)>,
}

fn open_reader(path: &Path) -> Result<SerializedFileReader<File>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let file = File::open(path)?;
    Ok(SerializedFileReader::new(file)?)
}

/// Column names in file order, flagged true when the physical type holds numbers.
fn column_kinds(reader: &SerializedFileReader<File>) -> Vec<(String, bool)> {
    reader
        .metadata()
        .file_metadata()
        .schema()
        .get_fields()
        .iter()
        .map(|field| {
            let numeric = field.is_primitive()
                && matches!(
                    field.get_physical_type(),
                    PhysicalType::BOOLEAN
                        | PhysicalType::INT32
                        | PhysicalType::INT64
                        | PhysicalType::FLOAT
                        | PhysicalType::DOUBLE
                );
            (field.name().to_string(), numeric)
        })
        .collect()
}

/// Numeric value of a parquet field; booleans count as 0/1 and NaN counts as null.
fn field_number(field: &Field) -> Option<f64> {
    let value = match field {
        Field::Bool(b) => f64::from(u8::from(*b)),
        Field::Byte(v) => f64::from(*v),
        Field::Short(v) => f64::from(*v),
        Field::Int(v) => f64::from(*v),
        Field::Long(v) => *v as f64,
        Field::UByte(v) => f64::from(*v),
        Field::UShort(v) => f64::from(*v),
        Field::UInt(v) => f64::from(*v),
        Field::ULong(v) => *v as f64,
        Field::Float(v) => f64::from(*v),
        Field::Double(v) => *v,
        _ => return None,
    };
    (!value.is_nan()).then_some(value)
}

fn field_text(field: &Field) -> Option<String> {
    match field {
        Field::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn field_int(field: &Field) -> Option<i32> {
    field_number(field).map(|v| v as i32)
}

/// input: parquet paths, the key columns every file must carry, an optional keep-list
/// output: numeric value columns (union over files, first-seen order) and keyed rows
/// logic: resolve key positions per file; skip rows whose keys are null; map each file's
/// numeric columns into the shared column list; pad rows once all files are read
fn load_keyed<K>(
    paths: &[PathBuf],
    keys: &[&str],
    keep: &[String],
    make_key: impl Fn(&[&Field]) -> Option<K>,
) -> Result<KeyedRows<K>> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();

    for path in paths {
        let reader = open_reader(path)?;
        let kinds = column_kinds(&reader);

        let mut key_positions = Vec::with_capacity(keys.len());
        for key in keys {
            let pos = kinds.iter().position(|(name, _)| name == key).ok_or_else(|| {
                PipelineError::Validation(format!(
                    "{} is missing required column {key}",
                    path.display()
                ))
            })?;
            key_positions.push(pos);
        }

        // (position in file, position in shared column list)
        let mut slots = Vec::new();
        for (pos, (name, numeric)) in kinds.iter().enumerate() {
            if !numeric || keys.contains(&name.as_str()) {
                continue;
            }
            if !keep.is_empty() && !keep.contains(name) {
                continue;
            }
            let slot = match columns.iter().position(|c| c == name) {
                Some(slot) => slot,
                None => {
                    columns.push(name.clone());
                    columns.len() - 1
                }
            };
            slots.push((pos, slot));
        }

        let mut skipped = 0usize;
        for row in reader.get_row_iter(None)? {
            let row = row?;
            let fields: Vec<&Field> = row.get_column_iter().map(|(_, field)| field).collect();
            let key_fields: Vec<&Field> = key_positions
                .iter()
                .filter_map(|&pos| fields.get(pos).copied())
                .collect();
            let Some(key) = make_key(&key_fields) else {
                skipped += 1;
                continue;
            };
            let mut values = vec![None; columns.len()];
            for &(pos, slot) in &slots {
                values[slot] = fields.get(pos).and_then(|field| field_number(field));
            }
            rows.push((key, values));
        }
        if skipped > 0 {
            eprintln!("Skipping {skipped} rows with null keys in {}", path.display());
        }
    }

    for (_, values) in rows.iter_mut() {
        values.resize(columns.len(), None);
    }
    Ok(KeyedRows { columns, rows })
}

/// Loads and concatenates play-by-play files. `keep` restricts the value columns when non-empty.
pub fn load_plays(paths: &[PathBuf], keep: &[String]) -> Result<PlayTable> {
    let loaded = load_keyed(paths, &PLAY_KEYS, keep, |f| {
        Some(Matchup {
            game_id: field_text(f.first()?)?,
            season: field_int(f.get(1)?)?,
            week: field_int(f.get(2)?)?,
            home_team: field_text(f.get(3)?)?,
            away_team: field_text(f.get(4)?)?,
        })
    })?;
    Ok(PlayTable {
        columns: loaded.columns,
        plays: loaded
            .rows
            .into_iter()
            .map(|(game, values)| Play { game, values })
            .collect(),
    })
}

pub fn load_team_weeks(paths: &[PathBuf]) -> Result<TeamWeekTable> {
    let loaded = load_keyed(paths, &TEAM_WEEK_KEYS, &[], |f| {
        Some((field_int(f.first()?)?, field_int(f.get(1)?)?, field_text(f.get(2)?)?))
    })?;
    Ok(TeamWeekTable {
        columns: loaded.columns,
        rows: loaded
            .rows
            .into_iter()
            .map(|((season, week, team), values)| TeamWeek { season, week, team, values })
            .collect(),
    })
}

pub fn load_feature_table(path: &Path) -> Result<FeatureTable> {
    let loaded = load_keyed(&[path.to_path_buf()], &FEATURE_KEYS, &[], |f| {
        let matchup = Matchup {
            season: field_int(f.first()?)?,
            week: field_int(f.get(1)?)?,
            game_id: field_text(f.get(2)?)?,
            home_team: field_text(f.get(3)?)?,
            away_team: field_text(f.get(4)?)?,
        };
        Some((matchup, field_int(f.get(5)?)?))
    })?;
    Ok(FeatureTable {
        columns: loaded.columns,
        rows: loaded
            .rows
            .into_iter()
            .map(|((matchup, result), values)| FeatureRow { matchup, result, values })
            .collect(),
    })
}

/// One column destined for a parquet file.
pub(crate) enum ColumnData {
    Int(Vec<i32>),
    Text(Vec<String>),
    Float(Vec<Option<f64>>),
}

fn column_type(name: &str, data: &ColumnData) -> Result<Type> {
    let builder = match data {
        ColumnData::Int(_) => Type::primitive_type_builder(name, PhysicalType::INT32)
            .with_repetition(Repetition::REQUIRED),
        ColumnData::Text(_) => Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY)
            .with_repetition(Repetition::REQUIRED)
            .with_converted_type(ConvertedType::UTF8),
        ColumnData::Float(_) => Type::primitive_type_builder(name, PhysicalType::DOUBLE)
            .with_repetition(Repetition::OPTIONAL),
    };
    Ok(builder.build()?)
}

fn write_column<T: DataType>(
    group: &mut SerializedRowGroupWriter<'_, File>,
    values: &[T::T],
    def_levels: Option<&[i16]>,
) -> Result<()> {
    let mut column = group.next_column()?.ok_or_else(|| {
        PipelineError::Validation("parquet schema has fewer columns than the table".to_string())
    })?;
    column.typed::<T>().write_batch(values, def_levels, None)?;
    column.close()?;
    Ok(())
}

/// Writes named columns as a single row group, replacing any existing file.
pub(crate) fn write_columns(path: &Path, table_name: &str, columns: &[(String, ColumnData)]) -> Result<()> {
    let mut fields = Vec::with_capacity(columns.len());
    for (name, data) in columns {
        fields.push(Arc::new(column_type(name, data)?));
    }
    let schema = Arc::new(Type::group_type_builder(table_name).with_fields(fields).build()?);
    let props = Arc::new(WriterProperties::builder().build());

    let file = File::create(path)?;
    let mut writer = SerializedFileWriter::new(file, schema, props)?;
    let mut group = writer.next_row_group()?;
    for (_, data) in columns {
        match data {
            ColumnData::Int(values) => write_column::<Int32Type>(&mut group, values, None)?,
            ColumnData::Text(values) => {
                let bytes: Vec<ByteArray> = values.iter().map(|s| ByteArray::from(s.as_str())).collect();
                write_column::<ByteArrayType>(&mut group, &bytes, None)?
            }
            ColumnData::Float(values) => {
                let levels: Vec<i16> = values.iter().map(|v| i16::from(v.is_some())).collect();
                let present: Vec<f64> = values.iter().flatten().copied().collect();
                write_column::<DoubleType>(&mut group, &present, Some(&levels))?
            }
        }
    }
    group.close()?;
    writer.close()?;
    Ok(())
}

pub fn write_feature_table(path: &Path, table: &FeatureTable) -> Result<()> {
    let rows = &table.rows;
    let mut columns = vec![
        ("season".to_string(), ColumnData::Int(rows.iter().map(|r| r.matchup.season).collect())),
        ("week".to_string(), ColumnData::Int(rows.iter().map(|r| r.matchup.week).collect())),
        (
            "game_id".to_string(),
            ColumnData::Text(rows.iter().map(|r| r.matchup.game_id.clone()).collect()),
        ),
        (
            "home_team".to_string(),
            ColumnData::Text(rows.iter().map(|r| r.matchup.home_team.clone()).collect()),
        ),
        (
            "away_team".to_string(),
            ColumnData::Text(rows.iter().map(|r| r.matchup.away_team.clone()).collect()),
        ),
        ("result".to_string(), ColumnData::Int(rows.iter().map(|r| r.result).collect())),
    ];
    for (idx, name) in table.columns.iter().enumerate() {
        let values = rows.iter().map(|r| r.values.get(idx).copied().flatten()).collect();
        columns.push((name.clone(), ColumnData::Float(values)));
    }
    write_columns(path, "features", &columns)
}

/// Text export of a feature table; nulls become empty fields.
pub fn write_feature_csv(path: &Path, table: &FeatureTable) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    let header = FEATURE_KEYS
        .iter()
        .map(|k| k.to_string())
        .chain(table.columns.iter().cloned());
    wtr.write_record(header)?;
    for row in &table.rows {
        let m = &row.matchup;
        let ids = [
            m.season.to_string(),
            m.week.to_string(),
            m.game_id.clone(),
            m.home_team.clone(),
            m.away_team.clone(),
            row.result.to_string(),
        ];
        let values = row
            .values
            .iter()
            .map(|v| v.map(|x| x.to_string()).unwrap_or_default());
        wtr.write_record(ids.into_iter().chain(values))?;
    }
    wtr.flush()?;
    Ok(())
}
