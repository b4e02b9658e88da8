//! Referencias globales opacas `gid://<app>/<Model>/<id>` usadas en los
//! valores del samplesheet para apuntar a attachments.
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

pub const ATTACHMENT_MODEL: &str = "Attachment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalId {
    pub app: String,
    pub model: String,
    pub id: Uuid,
}

impl GlobalId {
    pub fn attachment(app: &str, id: Uuid) -> Self {
        Self { app: app.to_string(),
               model: ATTACHMENT_MODEL.to_string(),
               id }
    }

    /// Id del attachment si `value` es una referencia global a uno.
    pub fn attachment_id(value: &str) -> Option<Uuid> {
        value.parse::<GlobalId>()
             .ok()
             .filter(|g| g.model == ATTACHMENT_MODEL)
             .map(|g| g.id)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid://{}/{}/{}", self.app, self.model, self.id)
    }
}

impl FromStr for GlobalId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.trim().strip_prefix("gid://").ok_or(())?;
        let mut parts = rest.split('/');
        let (app, model, id) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(m), Some(i), None) if !a.is_empty() && !m.is_empty() => (a, m, i),
            _ => return Err(()),
        };
        let id = Uuid::parse_str(id).map_err(|_| ())?;
        Ok(Self { app: app.to_string(),
                  model: model.to_string(),
                  id })
    }
}
