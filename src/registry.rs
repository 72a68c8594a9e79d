// 📇 Operator Registry Index
// Loads the operator master file once per run and indexes it by registry id
//
// The file arrives either as UTF-8 (with or without signature) or Latin-1, and
// the registry-id header has been renamed across releases. Both are handled by
// an ordered list of (encoding, header schema) candidates resolved once at
// load time; the first candidate that resolves every required column wins.

use crate::cnpj::{normalize_registry_id, normalize_tax_id};
use crate::error::RegistryLoadError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// OPERATOR RECORD
// ============================================================================

/// One row of the registry. Field names on the wire follow the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRecord {
    #[serde(rename = "REGISTRO_OPERADORA")]
    pub registry_id: String,
    #[serde(rename = "CNPJ")]
    pub tax_id: String,
    #[serde(rename = "Razao_Social")]
    pub legal_name: String,
    #[serde(rename = "Nome_Fantasia")]
    pub trade_name: Option<String>,
    #[serde(rename = "Modalidade")]
    pub modality: String,
    #[serde(rename = "Logradouro")]
    pub street: Option<String>,
    #[serde(rename = "Numero")]
    pub number: Option<String>,
    #[serde(rename = "Complemento")]
    pub complement: Option<String>,
    #[serde(rename = "Bairro")]
    pub district: Option<String>,
    #[serde(rename = "Cidade")]
    pub city: Option<String>,
    #[serde(rename = "UF")]
    pub state: String,
    #[serde(rename = "CEP")]
    pub postal_code: Option<String>,
    #[serde(rename = "DDD")]
    pub area_code: Option<String>,
    #[serde(rename = "Telefone")]
    pub phone: Option<String>,
    #[serde(rename = "Fax")]
    pub fax: Option<String>,
    #[serde(rename = "Endereco_eletronico")]
    pub email: Option<String>,
    #[serde(rename = "Representante")]
    pub representative: Option<String>,
    #[serde(rename = "Cargo_Representante")]
    pub representative_role: Option<String>,
    #[serde(rename = "Regiao_de_Comercializacao")]
    pub sales_region: Option<String>,
    #[serde(rename = "Data_Registro_ANS")]
    pub registered_on: Option<String>,
}

impl OperatorRecord {
    /// Minimal record with only the required columns filled
    pub fn new(registry_id: &str, tax_id: &str, legal_name: &str, modality: &str, state: &str) -> Self {
        OperatorRecord {
            registry_id: normalize_registry_id(registry_id),
            tax_id: normalize_tax_id(tax_id),
            legal_name: legal_name.to_string(),
            trade_name: None,
            modality: modality.to_string(),
            street: None,
            number: None,
            complement: None,
            district: None,
            city: None,
            state: state.to_string(),
            postal_code: None,
            area_code: None,
            phone: None,
            fax: None,
            email: None,
            representative: None,
            representative_role: None,
            sales_region: None,
            registered_on: None,
        }
    }
}

// ============================================================================
// ENCODINGS & HEADER SCHEMAS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    /// UTF-8, leading byte-order mark stripped if present
    Utf8Sig,
    Latin1,
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8Sig => {
                let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                std::str::from_utf8(body).ok().map(str::to_string)
            }
            // Every byte maps to the code point of the same value
            TextEncoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8Sig => "utf-8-sig",
            TextEncoding::Latin1 => "latin-1",
        }
    }
}

/// How a logical column is located among normalized header names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRule {
    /// Exact normalized name
    Named(String),
    /// Every `include` fragment and no `exclude` fragment appears in the normalized name
    Fragments { include: Vec<String>, exclude: Vec<String> },
}

impl ColumnRule {
    pub fn find(&self, headers: &[String]) -> Option<usize> {
        match self {
            ColumnRule::Named(name) => headers.iter().position(|h| h == name),
            ColumnRule::Fragments { include, exclude } => headers.iter().position(|h| {
                include.iter().all(|p| h.contains(p.as_str()))
                    && !exclude.iter().any(|p| h.contains(p.as_str()))
            }),
        }
    }

    fn describe(&self) -> String {
        match self {
            ColumnRule::Named(name) => name.clone(),
            ColumnRule::Fragments { include, .. } => format!("*{}*", include.join("*")),
        }
    }
}

/// Header schema variant: differs only in how the registry-id column is found
#[derive(Debug, Clone)]
pub struct HeaderSchema {
    pub name: &'static str,
    pub registry_id: ColumnRule,
}

/// Candidates in resolution order
pub fn candidates(primary_column: &str) -> Vec<(TextEncoding, HeaderSchema)> {
    let schemas = [
        HeaderSchema {
            name: "primary",
            registry_id: ColumnRule::Named(normalize_header(primary_column)),
        },
        HeaderSchema {
            name: "registry-ans-pattern",
            // "Data_Registro_ANS" is the registration date, not the id
            registry_id: ColumnRule::Fragments {
                include: vec!["registro".to_string(), "ans".to_string()],
                exclude: vec!["data".to_string()],
            },
        },
    ];

    [TextEncoding::Utf8Sig, TextEncoding::Latin1]
        .into_iter()
        .flat_map(|enc| schemas.iter().cloned().map(move |s| (enc, s)))
        .collect()
}

pub fn normalize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .replace(' ', "_")
}

/// Column positions, resolved once per load
#[derive(Debug, Clone, Default)]
struct ResolvedColumns {
    registry_id: usize,
    tax_id: usize,
    legal_name: usize,
    modality: usize,
    state: usize,
    trade_name: Option<usize>,
    street: Option<usize>,
    number: Option<usize>,
    complement: Option<usize>,
    district: Option<usize>,
    city: Option<usize>,
    postal_code: Option<usize>,
    area_code: Option<usize>,
    phone: Option<usize>,
    fax: Option<usize>,
    email: Option<usize>,
    representative: Option<usize>,
    representative_role: Option<usize>,
    sales_region: Option<usize>,
    registered_on: Option<usize>,
}

fn position_of(headers: &[String], names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h == name))
}

impl ResolvedColumns {
    /// Err carries the first logical column that could not be found
    fn resolve(headers: &[String], schema: &HeaderSchema) -> Result<Self, String> {
        let registry_id = schema
            .registry_id
            .find(headers)
            .ok_or_else(|| schema.registry_id.describe())?;
        let required = |names: &[&str]| position_of(headers, names).ok_or_else(|| names[0].to_string());

        Ok(ResolvedColumns {
            registry_id,
            tax_id: required(&["cnpj"])?,
            legal_name: required(&["razao_social", "razaosocial"])?,
            modality: required(&["modalidade"])?,
            state: required(&["uf"])?,
            trade_name: position_of(headers, &["nome_fantasia"]),
            street: position_of(headers, &["logradouro"]),
            number: position_of(headers, &["numero"]),
            complement: position_of(headers, &["complemento"]),
            district: position_of(headers, &["bairro"]),
            city: position_of(headers, &["cidade"]),
            postal_code: position_of(headers, &["cep"]),
            area_code: position_of(headers, &["ddd"]),
            phone: position_of(headers, &["telefone"]),
            fax: position_of(headers, &["fax"]),
            email: position_of(headers, &["endereco_eletronico"]),
            representative: position_of(headers, &["representante"]),
            representative_role: position_of(headers, &["cargo_representante"]),
            sales_region: position_of(headers, &["regiao_de_comercializacao"]),
            registered_on: position_of(headers, &["data_registro_ans"]),
        })
    }

    fn build(&self, record: &csv::StringRecord) -> OperatorRecord {
        let text = |i: usize| record.get(i).unwrap_or("").trim().to_string();
        let optional = |i: Option<usize>| {
            i.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        OperatorRecord {
            registry_id: normalize_registry_id(&text(self.registry_id)),
            tax_id: normalize_tax_id(&text(self.tax_id)),
            legal_name: text(self.legal_name),
            trade_name: optional(self.trade_name),
            modality: text(self.modality),
            street: optional(self.street),
            number: optional(self.number),
            complement: optional(self.complement),
            district: optional(self.district),
            city: optional(self.city),
            state: text(self.state),
            postal_code: optional(self.postal_code),
            area_code: optional(self.area_code),
            phone: optional(self.phone),
            fax: optional(self.fax),
            email: optional(self.email),
            representative: optional(self.representative),
            representative_role: optional(self.representative_role),
            sales_region: optional(self.sales_region),
            registered_on: optional(self.registered_on),
        }
    }
}

// ============================================================================
// REGISTRY INDEX
// ============================================================================

/// Read-only snapshot of the registry, keyed by 6-digit registry id
#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
    operators: BTreeMap<String, OperatorRecord>,
    duplicates_dropped: usize,
    encoding: Option<TextEncoding>,
}

impl RegistryIndex {
    /// Load and index the registry file. Any failure here is fatal for the run.
    pub fn load(path: &Path, primary_column: &str) -> Result<Self, RegistryLoadError> {
        let bytes = fs::read(path).map_err(|source| RegistryLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let index = Self::from_bytes(&bytes, path, primary_column)?;

        info!(
            path = %path.display(),
            operators = index.len(),
            duplicates = index.duplicates_dropped,
            encoding = index.encoding.map(|e| e.name()).unwrap_or("-"),
            "registry loaded"
        );

        Ok(index)
    }

    /// Index registry content already in memory; `path` is only used in errors
    pub fn from_bytes(bytes: &[u8], path: &Path, primary_column: &str) -> Result<Self, RegistryLoadError> {
        let mut decoded_any = false;
        let mut last_missing = String::new();
        let mut tried = Vec::new();

        for (encoding, schema) in candidates(primary_column) {
            tried.push(format!("{}/{}", encoding.name(), schema.name));

            let Some(text) = encoding.decode(bytes) else {
                continue;
            };
            decoded_any = true;

            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b';')
                .has_headers(true)
                .flexible(true)
                .from_reader(text.as_bytes());

            let headers: Vec<String> = reader
                .headers()
                .map_err(|source| RegistryLoadError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?
                .iter()
                .map(normalize_header)
                .collect();

            let columns = match ResolvedColumns::resolve(&headers, &schema) {
                Ok(columns) => columns,
                Err(missing) => {
                    debug!(encoding = encoding.name(), schema = schema.name, missing = missing.as_str(), "registry schema candidate rejected");
                    last_missing = missing;
                    continue;
                }
            };

            let mut index = RegistryIndex {
                encoding: Some(encoding),
                ..Default::default()
            };

            for result in reader.records() {
                let record = result.map_err(|source| RegistryLoadError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
                index.insert(columns.build(&record));
            }

            return Ok(index);
        }

        if !decoded_any {
            return Err(RegistryLoadError::Decode {
                path: path.to_path_buf(),
            });
        }

        Err(RegistryLoadError::MissingColumn {
            path: path.to_path_buf(),
            column: last_missing,
            tried: tried.join(", "),
        })
    }

    /// Build from records in order; first occurrence of an id wins
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = OperatorRecord>,
    {
        let mut index = RegistryIndex::default();
        for record in records {
            index.insert(record);
        }
        index
    }

    fn insert(&mut self, record: OperatorRecord) {
        if record.registry_id.chars().all(|c| c == '0') {
            debug!(legal_name = %record.legal_name, "registry row without id skipped");
            return;
        }

        if self.operators.contains_key(&record.registry_id) {
            debug!(registry_id = %record.registry_id, "duplicate registry id dropped");
            self.duplicates_dropped += 1;
            return;
        }

        self.operators.insert(record.registry_id.clone(), record);
    }

    pub fn lookup(&self, registry_id: &str) -> Option<&OperatorRecord> {
        self.operators.get(&normalize_registry_id(registry_id))
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }

    pub fn encoding(&self) -> Option<TextEncoding> {
        self.encoding
    }

    pub fn operators(&self) -> impl Iterator<Item = &OperatorRecord> {
        self.operators.values()
    }

    /// Split into (active, inactive): active ids are those present in `active_ids`
    pub fn partition(&self, active_ids: &HashSet<String>) -> (Vec<OperatorRecord>, Vec<OperatorRecord>) {
        self.operators
            .values()
            .cloned()
            .partition(|op| active_ids.contains(&op.registry_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "REGISTRO_OPERADORA;CNPJ;Razao_Social;Nome_Fantasia;Modalidade;Cidade;UF";

    fn index_from(text: &str) -> Result<RegistryIndex, RegistryLoadError> {
        RegistryIndex::from_bytes(text.as_bytes(), Path::new("test.csv"), "REGISTRO_OPERADORA")
    }

    #[test]
    fn test_load_primary_column() {
        let text = format!(
            "{}\n1;11.444.777/0001-61;Acme Saude;Acme;Medicina de Grupo;Sao Paulo;SP\n",
            HEADER
        );
        let index = index_from(&text).unwrap();

        let op = index.lookup("000001").expect("operator should be indexed");
        assert_eq!(op.tax_id, "11444777000161");
        assert_eq!(op.legal_name, "Acme Saude");
        assert_eq!(op.trade_name.as_deref(), Some("Acme"));
        assert_eq!(op.city.as_deref(), Some("Sao Paulo"));
        assert_eq!(op.state, "SP");
        assert_eq!(op.street, None);
        assert_eq!(index.encoding(), Some(TextEncoding::Utf8Sig));
    }

    #[test]
    fn test_load_falls_back_to_registry_ans_pattern() {
        let text = "Registro ANS;CNPJ;RazaoSocial;Modalidade;UF\n417;11222333000181;Beta;Cooperativa;RJ\n";
        let index = index_from(text).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup("417").unwrap().legal_name, "Beta");
        assert_eq!(index.lookup("000417").unwrap().state, "RJ");
    }

    #[test]
    fn test_registry_ans_pattern_skips_registration_date() {
        let text = "Data_Registro_ANS;Registro_ANS;CNPJ;Razao_Social;Modalidade;UF\n\
                    2001-05-10;417;11222333000181;Beta;Cooperativa;RJ\n";
        let index = index_from(text).unwrap();

        let op = index.lookup("000417").expect("id column should be Registro_ANS");
        assert_eq!(op.legal_name, "Beta");
        assert_eq!(op.registered_on.as_deref(), Some("2001-05-10"));
    }

    #[test]
    fn test_load_strips_utf8_signature() {
        let text = format!("\u{feff}{}\n2;11444777000161;Acme;;Medicina;SP;SP\n", HEADER);
        let index = index_from(&text).unwrap();
        assert!(index.lookup("000002").is_some());
    }

    #[test]
    fn test_load_falls_back_to_latin1() {
        let mut bytes = b"REGISTRO_OPERADORA;CNPJ;Razao_Social;Modalidade;UF\n5;11444777000161;S".to_vec();
        bytes.push(0xE3); // 'ã' in Latin-1, invalid as UTF-8
        bytes.extend_from_slice(b"o Lucas;Medicina;SP\n");

        let index = RegistryIndex::from_bytes(&bytes, Path::new("latin1.csv"), "registro_operadora").unwrap();

        assert_eq!(index.encoding(), Some(TextEncoding::Latin1));
        assert_eq!(index.lookup("5").unwrap().legal_name, "São Lucas");
    }

    #[test]
    fn test_missing_registry_column_is_fatal() {
        let text = "CODIGO;CNPJ;Razao_Social;Modalidade;UF\n1;11444777000161;Acme;Medicina;SP\n";
        match index_from(text) {
            Err(RegistryLoadError::MissingColumn { tried, .. }) => {
                assert!(tried.contains("latin-1/registry-ans-pattern"));
            }
            other => panic!("expected MissingColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = RegistryIndex::load(Path::new("/nonexistent/Relatorio_cadop.csv"), "registro_operadora");
        assert!(matches!(result, Err(RegistryLoadError::Io { .. })));
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let text = format!(
            "{}\n000001;11444777000161;First;;Medicina;SP;SP\n1;11222333000181;Second;;Medicina;RJ;RJ\n",
            HEADER
        );
        let index = index_from(&text).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.duplicates_dropped(), 1);
        let op = index.lookup("000001").unwrap();
        assert_eq!(op.tax_id, "11444777000161");
        assert_eq!(op.legal_name, "First");
    }

    #[test]
    fn test_partition_active_inactive() {
        let index = RegistryIndex::from_records(vec![
            OperatorRecord::new("1", "11444777000161", "A", "Medicina", "SP"),
            OperatorRecord::new("2", "11222333000181", "B", "Medicina", "RJ"),
        ]);
        let active: HashSet<String> = ["000002".to_string()].into_iter().collect();

        let (on, off) = index.partition(&active);

        assert_eq!(on.len(), 1);
        assert_eq!(on[0].legal_name, "B");
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].registry_id, "000001");
    }
}
