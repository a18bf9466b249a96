// src/dispatch/multipart.rs
use reqwest::multipart::{Form, Part};

#[derive(Debug, Clone)]
struct Field {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

/// `multipart/form-data` fields kept as plain values. A `reqwest` form is
/// single-use, so each attempt builds a fresh one and every retry sends the
/// same fields.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    fields: Vec<Field>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            filename: None,
            content_type: None,
            data: value.into().into_bytes(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        self.fields.push(Field {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fails only when a field carries an unparsable content type.
    pub fn to_form(&self) -> Result<Form, reqwest::Error> {
        let mut form = Form::new();
        for field in &self.fields {
            let mut part = Part::bytes(field.data.clone());
            if let Some(filename) = &field.filename {
                part = part.file_name(filename.clone());
            }
            if let Some(content_type) = &field.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part(field.name.clone(), part);
        }
        Ok(form)
    }
}
