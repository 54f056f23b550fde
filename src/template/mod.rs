//! Template payload builder: maps a logical notification kind plus a
//! parameter bag onto the ordered parameter list a registered WhatsApp
//! template expects.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{NotificationLogEntry, ParamBag};

pub mod dates;

pub const PARAM_NAME: &str = "nombre";
pub const PARAM_MESSAGE: &str = "mensaje";
pub const PARAM_HEADER_IMAGE: &str = "imagen_url";

/// Stand-in for one-time codes anywhere outside the outgoing message.
pub const REDACTED: &str = "****";

/// Address values that must never reach a customer as a delivery address.
const PLACEHOLDER_ADDRESSES: &[&str] = &[
    "",
    "-",
    "n/a",
    "na",
    "no aplica",
    "pendiente",
    "por definir",
    "por confirmar",
    "direccion",
    "dirección",
    "direccion por confirmar",
    "dirección por confirmar",
    "sin direccion",
    "sin dirección",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("template {template} is missing parameter '{param}'")]
    MissingParameter {
        template: &'static str,
        param: &'static str,
    },
    #[error("parameter '{param}' is not a valid date: {value}")]
    InvalidDate { param: &'static str, value: String },
    #[error("parameter '{param}' must be a specific address, got placeholder '{value}'")]
    PlaceholderAddress { param: &'static str, value: String },
    #[error("parameter '{param}' must be a 4-digit code, got '{value}'")]
    InvalidCode { param: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Date,
    Address,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub key: &'static str,
    pub kind: ParamKind,
}

const fn text(key: &'static str) -> ParamSpec {
    ParamSpec {
        key,
        kind: ParamKind::Text,
    }
}

const fn date(key: &'static str) -> ParamSpec {
    ParamSpec {
        key,
        kind: ParamKind::Date,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    ProximosViajes,
    LlegadaPaquetes,
    EntregaDomicilio,
    CodigoRedencion,
    CampanaGeneral,
    NotificacionGeneral,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 6] = [
        TemplateKind::ProximosViajes,
        TemplateKind::LlegadaPaquetes,
        TemplateKind::EntregaDomicilio,
        TemplateKind::CodigoRedencion,
        TemplateKind::CampanaGeneral,
        TemplateKind::NotificacionGeneral,
    ];

    /// Name registered with the provider.
    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::ProximosViajes => "proximos_viajes",
            TemplateKind::LlegadaPaquetes => "llegada_paquetes",
            TemplateKind::EntregaDomicilio => "entrega_domicilio",
            TemplateKind::CodigoRedencion => "codigo_redencion",
            TemplateKind::CampanaGeneral => "campana_general",
            TemplateKind::NotificacionGeneral => "notificacion_general",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, TemplateError> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))
    }

    /// Body parameters in placeholder order ({{1}}, {{2}}, ...).
    pub fn params(&self) -> &'static [ParamSpec] {
        const PROXIMOS_VIAJES: &[ParamSpec] = &[
            text(PARAM_NAME),
            date("fecha_salida"),
            date("fecha_regreso"),
            date("fecha_limite"),
        ];
        const LLEGADA_PAQUETES: &[ParamSpec] =
            &[text(PARAM_NAME), text("guias"), date("fecha_llegada")];
        const ENTREGA_DOMICILIO: &[ParamSpec] = &[
            text(PARAM_NAME),
            text("guia"),
            ParamSpec {
                key: "direccion",
                kind: ParamKind::Address,
            },
            date("fecha_entrega"),
        ];
        const CODIGO_REDENCION: &[ParamSpec] = &[
            text(PARAM_NAME),
            ParamSpec {
                key: "codigo",
                kind: ParamKind::Code,
            },
            text("puntos"),
        ];
        const NOMBRE_MENSAJE: &[ParamSpec] = &[text(PARAM_NAME), text(PARAM_MESSAGE)];

        match self {
            TemplateKind::ProximosViajes => PROXIMOS_VIAJES,
            TemplateKind::LlegadaPaquetes => LLEGADA_PAQUETES,
            TemplateKind::EntregaDomicilio => ENTREGA_DOMICILIO,
            TemplateKind::CodigoRedencion => CODIGO_REDENCION,
            TemplateKind::CampanaGeneral | TemplateKind::NotificacionGeneral => NOMBRE_MENSAJE,
        }
    }

    fn allows_header_image(&self) -> bool {
        matches!(self, TemplateKind::CampanaGeneral)
    }

    /// Human-readable copy of the registered template, used for the log preview.
    fn preview_text(&self) -> &'static str {
        match self {
            TemplateKind::ProximosViajes => {
                "Hola {{1}}, estas son nuestras próximas fechas de viaje: salida el {{2}} y regreso el {{3}}. Recibimos tus paquetes hasta el {{4}}."
            }
            TemplateKind::LlegadaPaquetes => {
                "Hola {{1}}, tus paquetes {{2}} llegaron el {{3}} y ya están en nuestra bodega."
            }
            TemplateKind::EntregaDomicilio => {
                "Hola {{1}}, tu paquete {{2}} será entregado en {{3}} el {{4}}."
            }
            TemplateKind::CodigoRedencion => {
                "Hola {{1}}, tu código para redimir {{3}} puntos es {{2}}. No lo compartas con nadie."
            }
            TemplateKind::CampanaGeneral | TemplateKind::NotificacionGeneral => "Hola {{1}}, {{2}}",
        }
    }
}

/// Provider-ready template content: name, language and ordered parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplatePayload {
    pub name: String,
    pub language: String,
    pub header_image: Option<String>,
    pub body_parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBuilder {
    language: String,
}

impl TemplateBuilder {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn build(&self, kind: TemplateKind, params: &ParamBag) -> Result<TemplatePayload, TemplateError> {
        let mut body_parameters = Vec::with_capacity(kind.params().len());
        for spec in kind.params() {
            let raw = params
                .get(spec.key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty() || spec.kind == ParamKind::Address)
                .ok_or(TemplateError::MissingParameter {
                    template: kind.name(),
                    param: spec.key,
                })?;
            body_parameters.push(render_param(spec, raw)?);
        }

        let header_image = if kind.allows_header_image() {
            params
                .get(PARAM_HEADER_IMAGE)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        } else {
            None
        };

        Ok(TemplatePayload {
            name: kind.name().to_string(),
            language: self.language.clone(),
            header_image,
            body_parameters,
        })
    }

    /// Fallback template for free-form messages outside the session window.
    pub fn fallback(&self, template_name: &str, recipient_name: &str, body: &str) -> TemplatePayload {
        TemplatePayload {
            name: template_name.to_string(),
            language: self.language.clone(),
            header_image: None,
            body_parameters: vec![recipient_name.to_string(), body.to_string()],
        }
    }
}

/// Fill the template copy with the rendered parameters. Codes are masked.
pub fn preview(kind: TemplateKind, payload: &TemplatePayload) -> String {
    let mut out = kind.preview_text().to_string();
    for (idx, (spec, value)) in kind.params().iter().zip(&payload.body_parameters).enumerate() {
        let value = if spec.kind == ParamKind::Code {
            REDACTED
        } else {
            value.as_str()
        };
        out = out.replace(&format!("{{{{{}}}}}", idx + 1), value);
    }
    out
}

/// Mask one-time codes in an entry before it is shown to anyone. The stored
/// row keeps them so execute can rebuild the payload.
pub fn redact_entry(entry: &mut NotificationLogEntry) {
    let Some(kind) = entry
        .template_name
        .as_deref()
        .and_then(|name| TemplateKind::from_name(name).ok())
    else {
        return;
    };
    for spec in kind.params().iter().filter(|s| s.kind == ParamKind::Code) {
        if let Some(value) = entry.template_params.get_mut(spec.key) {
            *value = REDACTED.to_string();
        }
    }
}

/// Substitute `{nombre}` in free-form copy.
pub fn personalize(body: &str, recipient_name: &str) -> String {
    body.replace("{nombre}", recipient_name)
}

pub fn is_placeholder_address(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    let normalized = normalized.trim_end_matches('.');
    PLACEHOLDER_ADDRESSES.contains(&normalized)
}

fn render_param(spec: &ParamSpec, raw: &str) -> Result<String, TemplateError> {
    match spec.kind {
        ParamKind::Text => Ok(raw.to_string()),
        ParamKind::Date => dates::localize(raw).ok_or_else(|| TemplateError::InvalidDate {
            param: spec.key,
            value: raw.to_string(),
        }),
        ParamKind::Address => {
            if is_placeholder_address(raw) {
                Err(TemplateError::PlaceholderAddress {
                    param: spec.key,
                    value: raw.to_string(),
                })
            } else {
                Ok(raw.to_string())
            }
        }
        ParamKind::Code => {
            if raw.len() == 4 && raw.chars().all(|c| c.is_ascii_digit()) {
                Ok(raw.to_string())
            } else {
                Err(TemplateError::InvalidCode {
                    param: spec.key,
                    value: raw.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(pairs: &[(&str, &str)]) -> ParamBag {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn proximos_viajes_has_four_ordered_params() {
        let builder = TemplateBuilder::new("es");
        let payload = builder
            .build(
                TemplateKind::ProximosViajes,
                &bag(&[
                    ("nombre", "Juan Pérez"),
                    ("fecha_salida", "2025-09-03"),
                    ("fecha_regreso", "2025-09-05"),
                    ("fecha_limite", "2025-09-02"),
                ]),
            )
            .unwrap();
        assert_eq!(payload.name, "proximos_viajes");
        assert_eq!(payload.language, "es");
        assert_eq!(
            payload.body_parameters,
            vec![
                "Juan Pérez",
                "miércoles 3 de septiembre",
                "viernes 5 de septiembre",
                "martes 2 de septiembre",
            ]
        );
        assert!(payload.header_image.is_none());
    }

    #[test]
    fn every_template_arity_matches_its_spec() {
        let builder = TemplateBuilder::new("es");
        let full = bag(&[
            ("nombre", "Ana"),
            ("fecha_salida", "2025-01-02"),
            ("fecha_regreso", "2025-01-09"),
            ("fecha_limite", "2025-01-01"),
            ("guias", "MX-1, MX-2"),
            ("guia", "MX-1"),
            ("fecha_llegada", "2025-01-10"),
            ("direccion", "Calle 10 # 43-12, Medellín"),
            ("fecha_entrega", "2025-01-11"),
            ("codigo", "0427"),
            ("puntos", "150"),
            ("mensaje", "tenemos descuentos"),
        ]);
        for kind in TemplateKind::ALL {
            let payload = builder.build(kind, &full).unwrap();
            assert_eq!(payload.body_parameters.len(), kind.params().len(), "{kind:?}");
            assert_eq!(TemplateKind::from_name(kind.name()).unwrap(), kind);
        }
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let builder = TemplateBuilder::new("es");
        let err = builder
            .build(
                TemplateKind::LlegadaPaquetes,
                &bag(&[("nombre", "Ana"), ("guias", "  ")]),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingParameter {
                template: "llegada_paquetes",
                param: "guias"
            }
        );
    }

    #[test]
    fn placeholder_address_is_rejected() {
        let builder = TemplateBuilder::new("es");
        for placeholder in ["Por confirmar", "sin dirección", "N/A", ""] {
            let err = builder
                .build(
                    TemplateKind::EntregaDomicilio,
                    &bag(&[
                        ("nombre", "Ana"),
                        ("guia", "MX-1"),
                        ("direccion", placeholder),
                        ("fecha_entrega", "2025-01-11"),
                    ]),
                )
                .unwrap_err();
            assert!(
                matches!(err, TemplateError::PlaceholderAddress { param: "direccion", .. }),
                "{placeholder}: {err:?}"
            );
        }
    }

    #[test]
    fn invalid_date_and_code() {
        let builder = TemplateBuilder::new("es");
        let err = builder
            .build(
                TemplateKind::LlegadaPaquetes,
                &bag(&[("nombre", "Ana"), ("guias", "MX-1"), ("fecha_llegada", "mañana")]),
            )
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidDate { .. }));

        let err = builder
            .build(
                TemplateKind::CodigoRedencion,
                &bag(&[("nombre", "Ana"), ("codigo", "12345"), ("puntos", "100")]),
            )
            .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidCode { .. }));
    }

    #[test]
    fn campaign_header_image_is_optional() {
        let builder = TemplateBuilder::new("es");
        let mut params = bag(&[("nombre", "Ana"), ("mensaje", "promo")]);
        let payload = builder.build(TemplateKind::CampanaGeneral, &params).unwrap();
        assert!(payload.header_image.is_none());

        params.insert(PARAM_HEADER_IMAGE.into(), "https://cdn.example/promo.jpg".into());
        let payload = builder.build(TemplateKind::CampanaGeneral, &params).unwrap();
        assert_eq!(payload.header_image.as_deref(), Some("https://cdn.example/promo.jpg"));

        // other templates ignore it
        let payload = builder
            .build(TemplateKind::NotificacionGeneral, &params)
            .unwrap();
        assert!(payload.header_image.is_none());
    }

    #[test]
    fn preview_fills_placeholders() {
        let builder = TemplateBuilder::new("es");
        let payload = builder
            .build(
                TemplateKind::CodigoRedencion,
                &bag(&[("nombre", "Ana"), ("codigo", "0427"), ("puntos", "150")]),
            )
            .unwrap();
        assert_eq!(
            preview(TemplateKind::CodigoRedencion, &payload),
            "Hola Ana, tu código para redimir 150 puntos es ****. No lo compartas con nadie."
        );
        // the payload itself still carries the code
        assert_eq!(payload.body_parameters[1], "0427");
        assert_eq!(personalize("Hola {nombre}!", "Ana"), "Hola Ana!");
    }

    #[test]
    fn redaction_masks_codes_only() {
        let mut entry = NotificationLogEntry {
            id: 1,
            batch_id: "redemption-1".into(),
            recipient_id: 2,
            recipient_name: "Ana".into(),
            recipient_phone: "+573001112233".into(),
            message_kind: crate::model::MessageKind::Template,
            message_body: String::new(),
            template_name: Some("codigo_redencion".into()),
            template_language: "es".into(),
            template_params: bag(&[("nombre", "Ana"), ("codigo", "0427"), ("puntos", "150")]),
            status: crate::model::LogStatus::Prepared,
            error_message: None,
            provider_message_id: None,
            sent_at: None,
            created_at: chrono::Utc::now(),
        };
        redact_entry(&mut entry);
        assert_eq!(entry.template_params["codigo"], REDACTED);
        assert_eq!(entry.template_params["puntos"], "150");

        entry.template_name = Some("notificacion_general".into());
        entry.template_params = bag(&[("nombre", "Ana"), ("mensaje", "0427")]);
        redact_entry(&mut entry);
        assert_eq!(entry.template_params["mensaje"], "0427");
    }

    #[test]
    fn unknown_template_name() {
        assert_eq!(
            TemplateKind::from_name("hello_world").unwrap_err(),
            TemplateError::UnknownTemplate("hello_world".into())
        );
    }
}
