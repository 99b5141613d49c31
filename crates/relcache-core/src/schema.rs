use crate::error::{CacheError, Result};
use crate::types::DataType;
use arrow::datatypes::{Field as ArrowField, Schema as ArrowSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn to_arrow(&self) -> ArrowField {
        ArrowField::new(self.name.clone(), self.data_type.to_arrow(), self.nullable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: vec![] }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| CacheError::ColumnNotFound(name.to_string()))
    }

    /// Schema containing only the fields at `indices`, in the given order.
    pub fn project(&self, indices: &[usize]) -> Result<Schema> {
        let fields = indices
            .iter()
            .map(|&i| {
                self.fields
                    .get(i)
                    .cloned()
                    .ok_or_else(|| CacheError::ColumnNotFound(format!("index {}", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::new(fields))
    }

    pub fn to_arrow(&self) -> ArrowSchema {
        let fields: Vec<ArrowField> = self.fields.iter().map(|f| f.to_arrow()).collect();
        ArrowSchema::new(fields)
    }

    /// Fails on Arrow types the cache cannot encode.
    pub fn from_arrow(schema: &ArrowSchema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                let data_type = DataType::from_arrow(f.data_type()).ok_or_else(|| {
                    CacheError::TypeMismatch {
                        expected: "Boolean/Int32/Int64/Float64/Utf8".to_string(),
                        found: f.data_type().to_string(),
                    }
                })?;
                Ok(Field::new(f.name(), data_type, f.is_nullable()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType as ArrowDataType;

    fn sample() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
        ])
    }

    #[test]
    fn test_index_of() {
        let schema = sample();
        assert_eq!(schema.index_of("name").unwrap(), 1);
        assert!(schema.index_of("missing").is_err());
    }

    #[test]
    fn test_project() {
        let schema = sample();
        let projected = schema.project(&[2, 0]).unwrap();
        assert_eq!(projected.field(0).unwrap().name(), "score");
        assert_eq!(projected.field(1).unwrap().name(), "id");
        assert!(schema.project(&[9]).is_err());
    }

    #[test]
    fn test_arrow_round_trip() {
        let schema = sample();
        let back = Schema::from_arrow(&schema.to_arrow()).unwrap();
        assert_eq!(schema, back);
    }

    #[test]
    fn test_from_arrow_rejects_unsupported() {
        let arrow = ArrowSchema::new(vec![ArrowField::new("d", ArrowDataType::Date32, false)]);
        assert!(Schema::from_arrow(&arrow).is_err());
    }
}
