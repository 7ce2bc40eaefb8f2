/// Canvas blocks, canvas items and detailed plan sections
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{clamp_percent, ItemId, Percent, PlanId, SectionId, UserId};

/// A dependency counts as satisfied once it is approved or at least this far along.
pub const DEPENDENCY_PROGRESS_THRESHOLD: Percent = 50;

/// Progress added to a detailed section each time non-blank content is saved.
pub const SAVE_PROGRESS_STEP: Percent = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Draft,
    Voting,
    Approved,
    Rejected,
}

text_enum!(ItemStatus, "item status", {
    Draft => "draft",
    Voting => "voting",
    Approved => "approved",
    Rejected => "rejected",
});

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Approved | ItemStatus::Rejected)
    }
}

/// The nine fixed blocks of the Business Model Canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasBlock {
    KeyPartners,
    KeyActivities,
    KeyResources,
    ValuePropositions,
    CustomerRelationships,
    Channels,
    CustomerSegments,
    CostStructure,
    RevenueStreams,
}

text_enum!(CanvasBlock, "canvas block", {
    KeyPartners => "key_partners",
    KeyActivities => "key_activities",
    KeyResources => "key_resources",
    ValuePropositions => "value_propositions",
    CustomerRelationships => "customer_relationships",
    Channels => "channels",
    CustomerSegments => "customer_segments",
    CostStructure => "cost_structure",
    RevenueStreams => "revenue_streams",
});

impl CanvasBlock {
    pub const ALL: [CanvasBlock; 9] = [
        CanvasBlock::KeyPartners,
        CanvasBlock::KeyActivities,
        CanvasBlock::KeyResources,
        CanvasBlock::ValuePropositions,
        CanvasBlock::CustomerRelationships,
        CanvasBlock::Channels,
        CanvasBlock::CustomerSegments,
        CanvasBlock::CostStructure,
        CanvasBlock::RevenueStreams,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            CanvasBlock::KeyPartners => "Key Partners",
            CanvasBlock::KeyActivities => "Key Activities",
            CanvasBlock::KeyResources => "Key Resources",
            CanvasBlock::ValuePropositions => "Value Propositions",
            CanvasBlock::CustomerRelationships => "Customer Relationships",
            CanvasBlock::Channels => "Channels",
            CanvasBlock::CustomerSegments => "Customer Segments",
            CanvasBlock::CostStructure => "Cost Structure",
            CanvasBlock::RevenueStreams => "Revenue Streams",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CanvasBlock::KeyPartners => "Who are the partners and suppliers the business relies on?",
            CanvasBlock::KeyActivities => "What must the business do well to deliver its value proposition?",
            CanvasBlock::KeyResources => "Which assets are indispensable to the business model?",
            CanvasBlock::ValuePropositions => "What value is delivered to customers, and which problems are solved?",
            CanvasBlock::CustomerRelationships => "What relationship does each customer segment expect?",
            CanvasBlock::Channels => "Through which channels are customers reached?",
            CanvasBlock::CustomerSegments => "For whom is value being created?",
            CanvasBlock::CostStructure => "What are the most important costs of the business model?",
            CanvasBlock::RevenueStreams => "For what value are customers willing to pay?",
        }
    }

    pub fn sort_order(&self) -> i64 {
        Self::ALL.iter().position(|b| b == self).unwrap_or_default() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSection {
    pub id: SectionId,
    pub plan_id: PlanId,
    pub block: CanvasBlock,
    pub title: String,
    pub description: String,
    pub sort_order: i64,
}

impl CanvasSection {
    pub fn for_block(plan_id: PlanId, block: CanvasBlock) -> Self {
        Self {
            id: SectionId::new(),
            plan_id,
            block,
            title: block.title().to_string(),
            description: block.description().to_string(),
            sort_order: block.sort_order(),
        }
    }
}

/// Advisory edit reservation held on a canvas item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemLock {
    pub holder: UserId,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ItemLock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasItem {
    pub id: ItemId,
    pub section_id: SectionId,
    pub plan_id: PlanId,
    pub content: String,
    pub status: ItemStatus,
    pub created_by: UserId,
    pub lock: Option<ItemLock>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanvasItem {
    pub fn new(plan_id: PlanId, section_id: SectionId, content: String, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new(),
            section_id,
            plan_id,
            content,
            status: ItemStatus::Draft,
            created_by,
            lock: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The lock, if one is held and its lease has not run out.
    pub fn live_lock(&self, now: DateTime<Utc>) -> Option<&ItemLock> {
        self.lock.as_ref().filter(|lock| lock.is_live(now))
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.live_lock(now).is_some()
    }

    pub fn is_locked_by(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        self.live_lock(now)
            .map(|lock| lock.holder == user_id)
            .unwrap_or(false)
    }

    /// Someone other than `user_id` currently holds the item.
    pub fn is_locked_by_other(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        self.is_locked(now) && !self.is_locked_by(user_id, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Concept,
    Research,
    Configuration,
    Projections,
}

text_enum!(Category, "category", {
    Concept => "concept",
    Research => "research",
    Configuration => "configuration",
    Projections => "projections",
});

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Concept,
        Category::Research,
        Category::Configuration,
        Category::Projections,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Category::Concept => "Concept",
            Category::Research => "Research",
            Category::Configuration => "Configuration",
            Category::Projections => "Projections",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedSection {
    pub id: SectionId,
    pub plan_id: PlanId,
    pub section_key: String,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub content: String,
    pub status: ItemStatus,
    pub progress_percentage: Percent,
    pub dependencies: Vec<String>,
    pub assigned_to: Option<UserId>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DetailedSection {
    pub fn from_template(plan_id: PlanId, template: &DetailedSectionTemplate) -> Self {
        let now = Utc::now();
        Self {
            id: SectionId::new(),
            plan_id,
            section_key: template.key.to_string(),
            category: template.category,
            title: template.title.to_string(),
            description: template.description.to_string(),
            content: String::new(),
            status: ItemStatus::Draft,
            progress_percentage: 0,
            dependencies: template.dependencies.iter().map(|d| d.to_string()).collect(),
            assigned_to: None,
            deadline: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Approved sections count as complete regardless of the stored figure.
    pub fn effective_progress(&self) -> Percent {
        if self.status == ItemStatus::Approved {
            100
        } else {
            self.progress_percentage
        }
    }

    pub fn satisfies_dependents(&self) -> bool {
        self.status == ItemStatus::Approved
            || self.progress_percentage >= DEPENDENCY_PROGRESS_THRESHOLD
    }

    /// Stored progress after saving `content` over the current state.
    pub fn progress_after_save(&self, content: &str) -> Percent {
        if content.trim().is_empty() {
            0
        } else {
            clamp_percent(self.progress_percentage as i64 + SAVE_PROGRESS_STEP as i64)
        }
    }
}

/// Keys of `section`'s declared dependencies that are not yet satisfied.
///
/// Dependencies that name no section in `siblings` are ignored.
pub fn unmet_dependencies(section: &DetailedSection, siblings: &[DetailedSection]) -> Vec<String> {
    section
        .dependencies
        .iter()
        .filter(|key| {
            siblings
                .iter()
                .filter(|s| &s.section_key == *key)
                .any(|s| !s.satisfies_dependents())
        })
        .cloned()
        .collect()
}

pub fn dependencies_satisfied(section: &DetailedSection, siblings: &[DetailedSection]) -> bool {
    unmet_dependencies(section, siblings).is_empty()
}

#[derive(Debug, Clone, Copy)]
pub struct DetailedSectionTemplate {
    pub key: &'static str,
    pub category: Category,
    pub title: &'static str,
    pub description: &'static str,
    pub dependencies: &'static [&'static str],
}

/// Sections seeded into every new plan.
pub const DEFAULT_DETAILED_SECTIONS: &[DetailedSectionTemplate] = &[
    DetailedSectionTemplate {
        key: "executive_summary",
        category: Category::Concept,
        title: "Executive Summary",
        description: "The plan in one page: opportunity, solution, ask.",
        dependencies: &[],
    },
    DetailedSectionTemplate {
        key: "business_concept",
        category: Category::Concept,
        title: "Business Concept",
        description: "What the business does and why it matters.",
        dependencies: &[],
    },
    DetailedSectionTemplate {
        key: "mission_vision",
        category: Category::Concept,
        title: "Mission and Vision",
        description: "Purpose, long-term ambition and values.",
        dependencies: &["business_concept"],
    },
    DetailedSectionTemplate {
        key: "market_analysis",
        category: Category::Research,
        title: "Market Analysis",
        description: "Market size, trends and growth drivers.",
        dependencies: &["business_concept"],
    },
    DetailedSectionTemplate {
        key: "competitor_analysis",
        category: Category::Research,
        title: "Competitor Analysis",
        description: "Direct and indirect competitors, strengths and gaps.",
        dependencies: &["market_analysis"],
    },
    DetailedSectionTemplate {
        key: "target_audience",
        category: Category::Research,
        title: "Target Audience",
        description: "Personas, needs and buying behaviour.",
        dependencies: &["market_analysis"],
    },
    DetailedSectionTemplate {
        key: "marketing_plan",
        category: Category::Configuration,
        title: "Marketing Plan",
        description: "Positioning, pricing, promotion and distribution.",
        dependencies: &["target_audience"],
    },
    DetailedSectionTemplate {
        key: "operations_plan",
        category: Category::Configuration,
        title: "Operations Plan",
        description: "Processes, suppliers, facilities and technology.",
        dependencies: &["business_concept"],
    },
    DetailedSectionTemplate {
        key: "team_structure",
        category: Category::Configuration,
        title: "Team Structure",
        description: "Roles, responsibilities and hiring plan.",
        dependencies: &["operations_plan"],
    },
    DetailedSectionTemplate {
        key: "financial_projections",
        category: Category::Projections,
        title: "Financial Projections",
        description: "Revenue, costs, cash flow and break-even.",
        dependencies: &["marketing_plan", "operations_plan"],
    },
    DetailedSectionTemplate {
        key: "investment_plan",
        category: Category::Projections,
        title: "Investment Plan",
        description: "Capital required and how it will be used.",
        dependencies: &["financial_projections"],
    },
    DetailedSectionTemplate {
        key: "risk_analysis",
        category: Category::Projections,
        title: "Risk Analysis",
        description: "Key risks and mitigations.",
        dependencies: &["market_analysis"],
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn section(key: &str, deps: &[&str]) -> DetailedSection {
        let template = DetailedSectionTemplate {
            key: "placeholder",
            category: Category::Concept,
            title: "t",
            description: "d",
            dependencies: &[],
        };
        let mut s = DetailedSection::from_template(PlanId::new(), &template);
        s.section_key = key.to_string();
        s.dependencies = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    #[test]
    fn test_dependency_gating() {
        let mut a = section("a", &[]);
        let b = section("b", &["a"]);

        a.progress_percentage = 20;
        let siblings = vec![a.clone(), b.clone()];
        assert_eq!(unmet_dependencies(&b, &siblings), vec!["a".to_string()]);

        a.progress_percentage = 50;
        let siblings = vec![a.clone(), b.clone()];
        assert!(dependencies_satisfied(&b, &siblings));

        a.progress_percentage = 0;
        a.status = ItemStatus::Approved;
        let siblings = vec![a, b.clone()];
        assert!(dependencies_satisfied(&b, &siblings));
    }

    #[test]
    fn test_unknown_dependency_is_ignored() {
        let b = section("b", &["missing"]);
        assert!(dependencies_satisfied(&b, &[b.clone()]));
    }

    #[test]
    fn test_progress_after_save() {
        let mut s = section("a", &[]);
        assert_eq!(s.progress_after_save("draft text"), 25);
        s.progress_percentage = 90;
        assert_eq!(s.progress_after_save("more"), 100);
        assert_eq!(s.progress_after_save("   "), 0);
    }

    #[test]
    fn test_effective_progress_of_approved_section() {
        let mut s = section("a", &[]);
        s.progress_percentage = 30;
        assert_eq!(s.effective_progress(), 30);
        s.status = ItemStatus::Approved;
        assert_eq!(s.effective_progress(), 100);
    }

    #[test]
    fn test_expired_lock_is_not_live() {
        let now = Utc::now();
        let holder = UserId::new();
        let mut item = CanvasItem::new(PlanId::new(), SectionId::new(), "x".into(), holder);
        item.lock = Some(ItemLock {
            holder,
            locked_at: now - Duration::minutes(10),
            expires_at: now - Duration::seconds(1),
        });
        assert!(!item.is_locked(now));
        assert!(!item.is_locked_by(holder, now));

        item.lock.as_mut().unwrap().expires_at = now + Duration::minutes(1);
        assert!(item.is_locked_by(holder, now));
        assert!(item.is_locked_by_other(UserId::new(), now));
    }

    #[test]
    fn test_default_catalog_dependencies_resolve() {
        for template in DEFAULT_DETAILED_SECTIONS {
            for dep in template.dependencies {
                assert!(
                    DEFAULT_DETAILED_SECTIONS.iter().any(|t| t.key == *dep),
                    "{} depends on unknown section {}",
                    template.key,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_canvas_blocks_are_ordered() {
        assert_eq!(CanvasBlock::KeyPartners.sort_order(), 0);
        assert_eq!(CanvasBlock::RevenueStreams.sort_order(), 8);
        assert_eq!("channels".parse::<CanvasBlock>().unwrap(), CanvasBlock::Channels);
    }
}
