//! Service templates: named protocol/port presets

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;
use wirewarp_db::entities::service_template;
use wirewarp_db::is_unique_violation;
use wirewarp_proto::{
    parse_port_list, ForwardProtocol, PortForwardDraft, ServiceTemplate, TemplateProtocol,
};

use crate::convert;
use crate::error::{ControlError, Result};

/// Templates every installation starts with
pub const BUILTIN_TEMPLATES: &[(&str, TemplateProtocol, &str)] = &[
    ("DayZ", TemplateProtocol::Udp, "2302-2305,27016"),
    ("Minecraft", TemplateProtocol::Tcp, "25565"),
    ("Web", TemplateProtocol::Tcp, "80,443"),
    ("RDP", TemplateProtocol::Tcp, "3389"),
];

/// Input for applying a template
#[derive(Debug, Clone)]
pub struct TemplateApplication {
    pub tunnel_server_id: Uuid,
    pub tunnel_client_id: Uuid,
    pub destination_ip: String,
    /// Only consulted for `both` templates; defaults to tcp
    pub protocol: Option<ForwardProtocol>,
}

/// Pre-fill a port-forward draft from a template
///
/// The lower bound of the first port entry seeds both ports. One draft per
/// apply; ranges are not expanded.
pub fn apply_template(
    template: &ServiceTemplate,
    application: TemplateApplication,
) -> Result<PortForwardDraft> {
    let ranges = parse_port_list(&template.ports)
        .map_err(|e| ControlError::validation(e.to_string()))?;
    let first = ranges
        .first()
        .ok_or_else(|| ControlError::validation("Template has no ports"))?;

    let protocol = match template.protocol {
        TemplateProtocol::Tcp => ForwardProtocol::Tcp,
        TemplateProtocol::Udp => ForwardProtocol::Udp,
        TemplateProtocol::Both => application.protocol.unwrap_or(ForwardProtocol::Tcp),
    };

    Ok(PortForwardDraft {
        tunnel_server_id: application.tunnel_server_id,
        tunnel_client_id: application.tunnel_client_id,
        protocol: protocol.as_str().to_string(),
        public_port: first.start as i64,
        destination_ip: application.destination_ip,
        destination_port: first.start as i64,
        description: Some(template.name.clone()),
        active: Some(true),
    })
}

pub struct TemplateCatalog {
    db: DatabaseConnection,
    seeded: AtomicBool,
}

impl TemplateCatalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            seeded: AtomicBool::new(false),
        }
    }

    /// Insert missing built-ins. Safe to call any number of times.
    pub async fn ensure_builtins(&self) -> Result<()> {
        if self.seeded.load(Ordering::Acquire) {
            return Ok(());
        }

        for (name, protocol, ports) in BUILTIN_TEMPLATES {
            let exists = service_template::Entity::find()
                .filter(service_template::Column::Name.eq(*name))
                .one(&self.db)
                .await?
                .is_some();
            if exists {
                continue;
            }

            let inserted = service_template::ActiveModel {
                id: Set(Uuid::new_v4()),
                name: Set(name.to_string()),
                protocol: Set(protocol.as_str().to_string()),
                ports: Set(ports.to_string()),
                is_builtin: Set(true),
                created_at: Set(Utc::now()),
            }
            .insert(&self.db)
            .await;

            match inserted {
                Ok(_) => debug!(template = %name, "Seeded built-in service template"),
                // seeded concurrently
                Err(e) if is_unique_violation(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.seeded.store(true, Ordering::Release);
        Ok(())
    }

    /// Built-ins first, then custom templates by name
    pub async fn list(&self) -> Result<Vec<ServiceTemplate>> {
        self.ensure_builtins().await?;

        let rows = service_template::Entity::find()
            .order_by_desc(service_template::Column::IsBuiltin)
            .order_by_asc(service_template::Column::Name)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| convert::service_template(row).map_err(ControlError::from))
            .collect()
    }

    pub async fn get(&self, template_id: Uuid) -> Result<ServiceTemplate> {
        self.ensure_builtins().await?;

        let row = service_template::Entity::find_by_id(template_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found("service template", template_id))?;
        Ok(convert::service_template(row)?)
    }

    /// Add a custom template
    pub async fn create(&self, name: &str, protocol: &str, ports: &str) -> Result<ServiceTemplate> {
        self.ensure_builtins().await?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ControlError::validation("Template name must not be empty"));
        }
        let protocol = protocol
            .trim()
            .parse::<TemplateProtocol>()
            .map_err(ControlError::Validation)?;
        let ports = ports.trim();
        parse_port_list(ports).map_err(|e| ControlError::validation(e.to_string()))?;

        let row = service_template::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            protocol: Set(protocol.as_str().to_string()),
            ports: Set(ports.to_string()),
            is_builtin: Set(false),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::DuplicateTemplate(name.to_string())
            } else {
                e.into()
            }
        })?;

        info!(
            name = %row.name,
            protocol = %row.protocol,
            ports = %row.ports,
            "Created service template"
        );
        Ok(convert::service_template(row)?)
    }

    /// Look up a template and pre-fill a draft from it
    pub async fn apply(
        &self,
        template_id: Uuid,
        application: TemplateApplication,
    ) -> Result<PortForwardDraft> {
        let template = self.get(template_id).await?;
        apply_template(&template, application)
    }
}
