// orchestra/src/records.rs - Default record and monitoring builders

use orchestra_core::{
    descriptor_reference, DeployResult, DeploymentRecords, MonitoringBuilder, RecordBuilder, ServiceRequest,
};
use serde_json::{json, Value};

/// Builds records from the request descriptors, merging whatever the
/// adaptor reported under `service_record` / `component_records`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptorRecords;

impl RecordBuilder for AdaptorRecords {
    fn build(
        &self,
        request: &ServiceRequest,
        instance_uuid: &str,
        resource_id: &str,
        deployment: &DeployResult,
    ) -> anyhow::Result<DeploymentRecords> {
        let reported_components = match deployment.details.get("component_records") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => anyhow::bail!("component_records must be a sequence, got {}", other),
        };

        let component_records: Vec<Value> = request
            .component_descriptors
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let mut record = json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "descriptor_reference": descriptor_reference(descriptor),
                    "instance_uuid": instance_uuid,
                    "status": deployment.request_status,
                });
                if let (Some(Value::Object(reported)), Some(target)) =
                    (reported_components.get(index), record.as_object_mut())
                {
                    target.extend(reported.clone());
                }
                record
            })
            .collect();

        let mut service_record = json!({
            "id": instance_uuid,
            "descriptor_reference": descriptor_reference(&request.service_descriptor),
            "resource_id": resource_id,
            "status": deployment.request_status,
            "component_records": component_records
                .iter()
                .map(|record| record["id"].clone())
                .collect::<Vec<_>>(),
        });
        if let (Some(Value::Object(reported)), Some(target)) =
            (deployment.details.get("service_record"), service_record.as_object_mut())
        {
            target.extend(reported.clone());
        }

        Ok(DeploymentRecords {
            service_record,
            component_records,
        })
    }
}

/// Monitoring configuration listing the service and its components
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceMonitoring;

impl MonitoringBuilder for ServiceMonitoring {
    fn build(&self, _request: &ServiceRequest, records: &DeploymentRecords) -> Option<Value> {
        if records.component_records.is_empty() {
            return None;
        }

        let components: Vec<Value> = records
            .component_records
            .iter()
            .map(|record| {
                json!({
                    "id": record["id"],
                    "descriptor_reference": record["descriptor_reference"],
                })
            })
            .collect();

        Some(json!({
            "service_id": records.service_record["id"],
            "resource_id": records.service_record["resource_id"],
            "components": components,
        }))
    }
}
