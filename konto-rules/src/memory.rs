use std::collections::HashMap;

use async_trait::async_trait;
use konto_common::TenantId;
use tokio::sync::RwLock;

use crate::ActiveRuleQuery;
use crate::DifferenceProfile;
use crate::PostingTemplate;
use crate::ProfileId;
use crate::ProfileStore;
use crate::Rule;
use crate::RuleId;
use crate::RuleStore;
use crate::RulesError;
use crate::RulesResult;
use crate::TemplateId;
use crate::TemplateStore;

#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<RuleId, Rule>>,
    seq: RwLock<i64>,
}

impl InMemoryRuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn upsert(&self, mut rule: Rule) -> RulesResult<Rule> {
        rule.validate()?;
        let mut guard = self.rules.write().await;
        if rule.id <= 0 {
            let mut seq = self.seq.write().await;
            *seq += 1;
            rule.id = *seq;
        }
        // rule_code is unique per tenant.
        if guard.values().any(|existing| {
            existing.tenant_id == rule.tenant_id
                && existing.rule_code == rule.rule_code
                && existing.id != rule.id
        }) {
            return Err(RulesError::Conflict(format!(
                "rule code {} already exists",
                rule.rule_code
            )));
        }
        guard.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get(&self, tenant_id: TenantId, rule_id: RuleId) -> RulesResult<Rule> {
        let guard = self.rules.read().await;
        guard
            .get(&rule_id)
            .filter(|rule| rule.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| RulesError::NotFound(format!("rule {rule_id}")))
    }

    async fn find_by_code(
        &self,
        tenant_id: TenantId,
        rule_code: &str,
    ) -> RulesResult<Option<Rule>> {
        let guard = self.rules.read().await;
        Ok(guard
            .values()
            .find(|rule| rule.tenant_id == tenant_id && rule.rule_code == rule_code)
            .cloned())
    }

    async fn list(&self, tenant_id: TenantId) -> RulesResult<Vec<Rule>> {
        let guard = self.rules.read().await;
        let mut rules: Vec<Rule> = guard
            .values()
            .filter(|rule| rule.tenant_id == tenant_id)
            .cloned()
            .collect();
        rules.sort_by_key(|rule| rule.id);
        Ok(rules)
    }

    async fn list_active(
        &self,
        tenant_id: TenantId,
        query: ActiveRuleQuery,
    ) -> RulesResult<Vec<Rule>> {
        let guard = self.rules.read().await;
        let mut rules: Vec<Rule> = guard
            .values()
            .filter(|rule| rule.tenant_id == tenant_id)
            .filter(|rule| rule.is_effective(query.txn_date))
            .filter(|rule| {
                rule.scope
                    .applies_to(query.legal_entity_id, query.bank_account_id)
            })
            .cloned()
            .collect();
        rules.sort_by_key(|rule| (rule.priority, rule.id));
        Ok(rules)
    }
}

#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<TemplateId, PostingTemplate>>,
    seq: RwLock<i64>,
}

impl InMemoryTemplateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn upsert(&self, mut template: PostingTemplate) -> RulesResult<PostingTemplate> {
        template.validate()?;
        let mut guard = self.templates.write().await;
        if template.id <= 0 {
            let mut seq = self.seq.write().await;
            *seq += 1;
            template.id = *seq;
        }
        guard.insert(template.id, template.clone());
        Ok(template)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        template_id: TemplateId,
    ) -> RulesResult<PostingTemplate> {
        let guard = self.templates.read().await;
        guard
            .get(&template_id)
            .filter(|template| template.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| RulesError::NotFound(format!("posting template {template_id}")))
    }

    async fn list(&self, tenant_id: TenantId) -> RulesResult<Vec<PostingTemplate>> {
        let guard = self.templates.read().await;
        let mut templates: Vec<PostingTemplate> = guard
            .values()
            .filter(|template| template.tenant_id == tenant_id)
            .cloned()
            .collect();
        templates.sort_by_key(|template| template.id);
        Ok(templates)
    }
}

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<ProfileId, DifferenceProfile>>,
    seq: RwLock<i64>,
}

impl InMemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn upsert(&self, mut profile: DifferenceProfile) -> RulesResult<DifferenceProfile> {
        profile.validate()?;
        let mut guard = self.profiles.write().await;
        if profile.id <= 0 {
            let mut seq = self.seq.write().await;
            *seq += 1;
            profile.id = *seq;
        }
        guard.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        profile_id: ProfileId,
    ) -> RulesResult<DifferenceProfile> {
        let guard = self.profiles.read().await;
        guard
            .get(&profile_id)
            .filter(|profile| profile.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| RulesError::NotFound(format!("difference profile {profile_id}")))
    }

    async fn list(&self, tenant_id: TenantId) -> RulesResult<Vec<DifferenceProfile>> {
        let guard = self.profiles.read().await;
        let mut profiles: Vec<DifferenceProfile> = guard
            .values()
            .filter(|profile| profile.tenant_id == tenant_id)
            .cloned()
            .collect();
        profiles.sort_by_key(|profile| profile.id);
        Ok(profiles)
    }
}
