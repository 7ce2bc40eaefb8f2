/// Plan progress: pure aggregation over a full snapshot, plus a tracker that
/// recomputes whenever the feed reports a change.
use std::collections::HashMap;
use std::sync::Arc;

use plan::{
    clamp_percent, CanvasItem, CanvasSection, Category, DetailedSection, ItemStatus, Percent, Plan,
    PlanId, SectionId,
};
use serde::{Deserialize, Serialize};
use store::{PlanStore, Table};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{ChangeFeed, CollaborationError, ResourceDescriptor, Result, SubscriptionHandle};

fn mean(values: impl IntoIterator<Item = Percent>) -> Percent {
    let (sum, count) = values
        .into_iter()
        .fold((0u64, 0u64), |(sum, count), v| (sum + v as u64, count + 1));
    if count == 0 {
        return 0;
    }
    clamp_percent((sum as f64 / count as f64).round() as i64)
}

fn ratio(part: usize, total: usize) -> Percent {
    if total == 0 {
        return 0;
    }
    clamp_percent((part as f64 * 100.0 / total as f64).round() as i64)
}

/// Mean of each section's own progress; approved sections count as 100.
pub fn category_progress(sections: &[DetailedSection]) -> Percent {
    mean(sections.iter().map(DetailedSection::effective_progress))
}

/// Share of approved items in one canvas section, 0 when it has none.
pub fn canvas_section_progress(items: &[&CanvasItem]) -> Percent {
    let approved = items
        .iter()
        .filter(|item| item.status == ItemStatus::Approved)
        .count();
    ratio(approved, items.len())
}

fn items_by_section(items: &[CanvasItem]) -> HashMap<SectionId, Vec<&CanvasItem>> {
    let mut grouped: HashMap<SectionId, Vec<&CanvasItem>> = HashMap::new();
    for item in items {
        grouped.entry(item.section_id).or_default().push(item);
    }
    grouped
}

/// Unweighted mean over sections: a section with one approved item counts
/// as much as a section with ten.
pub fn canvas_progress(sections: &[CanvasSection], items: &[CanvasItem]) -> Percent {
    let grouped = items_by_section(items);
    mean(sections.iter().map(|section| {
        grouped
            .get(&section.id)
            .map(|items| canvas_section_progress(items))
            .unwrap_or(0)
    }))
}

/// Everything progress is derived from, read in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSnapshot {
    pub plan: Plan,
    pub canvas_sections: Vec<CanvasSection>,
    pub canvas_items: Vec<CanvasItem>,
    pub detailed_sections: Vec<DetailedSection>,
    pub active_members: usize,
}

impl PlanSnapshot {
    pub fn load(store: &dyn PlanStore, plan_id: PlanId) -> Result<Self> {
        let plan = store
            .get_plan(plan_id)?
            .ok_or_else(|| CollaborationError::not_found("plan", plan_id))?;
        Ok(Self {
            plan,
            canvas_sections: store.list_canvas_sections(plan_id)?,
            canvas_items: store.list_canvas_items(plan_id)?,
            detailed_sections: store.list_detailed_sections(plan_id)?,
            active_members: store.count_active_members(plan_id)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionProgress {
    pub id: SectionId,
    pub title: String,
    pub status: ItemStatus,
    pub progress: Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryProgress {
    /// None for the canvas group
    pub category: Option<Category>,
    pub title: String,
    pub progress: Percent,
    pub sections: Vec<SectionProgress>,
}

/// Dashboard figures for one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub plan_id: PlanId,
    pub total_sections: usize,
    pub approved_sections: usize,
    /// Detailed sections under vote
    pub pending_sections: usize,
    pub rejected_sections: usize,
    pub active_members: usize,
    pub canvas_progress: Percent,
    pub detailed_progress: Percent,
    /// Approved sections over all sections, canvas and detailed alike
    pub overall_progress: Percent,
    pub categories: Vec<CategoryProgress>,
}

impl DashboardStats {
    pub fn compute(snapshot: &PlanSnapshot) -> Self {
        let grouped = items_by_section(&snapshot.canvas_items);
        let canvas: Vec<SectionProgress> = snapshot
            .canvas_sections
            .iter()
            .map(|section| {
                let items = grouped.get(&section.id).map(Vec::as_slice).unwrap_or(&[]);
                let progress = canvas_section_progress(items);
                let status = if progress == 100 {
                    ItemStatus::Approved
                } else if items.iter().any(|i| i.status == ItemStatus::Voting) {
                    ItemStatus::Voting
                } else {
                    ItemStatus::Draft
                };
                SectionProgress {
                    id: section.id,
                    title: section.title.clone(),
                    status,
                    progress,
                }
            })
            .collect();
        let canvas_approved = snapshot
            .canvas_sections
            .iter()
            .filter(|section| {
                grouped
                    .get(&section.id)
                    .map(|items| items.iter().any(|i| i.status == ItemStatus::Approved))
                    .unwrap_or(false)
            })
            .count();

        let detailed = &snapshot.detailed_sections;
        let count = |status: ItemStatus| detailed.iter().filter(|s| s.status == status).count();

        let mut categories = vec![CategoryProgress {
            category: None,
            title: "Business Model Canvas".to_string(),
            progress: mean(canvas.iter().map(|s| s.progress)),
            sections: canvas,
        }];
        for category in Category::ALL {
            let members: Vec<DetailedSection> = detailed
                .iter()
                .filter(|s| s.category == category)
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }
            categories.push(CategoryProgress {
                category: Some(category),
                title: category.title().to_string(),
                progress: category_progress(&members),
                sections: members
                    .iter()
                    .map(|s| SectionProgress {
                        id: s.id,
                        title: s.title.clone(),
                        status: s.status,
                        progress: s.effective_progress(),
                    })
                    .collect(),
            });
        }

        let total_sections = snapshot.canvas_sections.len() + detailed.len();
        let approved_sections = canvas_approved + count(ItemStatus::Approved);
        Self {
            plan_id: snapshot.plan.id,
            total_sections,
            approved_sections,
            pending_sections: count(ItemStatus::Voting),
            rejected_sections: count(ItemStatus::Rejected),
            active_members: snapshot.active_members,
            canvas_progress: canvas_progress(&snapshot.canvas_sections, &snapshot.canvas_items),
            detailed_progress: category_progress(detailed),
            overall_progress: ratio(approved_sections, total_sections),
            categories,
        }
    }
}

/// Recomputes dashboard figures from fresh reads and persists the overall
/// percentage onto the plan.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn PlanStore>,
    feed: ChangeFeed,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn PlanStore>, feed: ChangeFeed) -> Self {
        Self { store, feed }
    }

    pub fn recompute(&self, plan_id: PlanId) -> Result<DashboardStats> {
        let snapshot = PlanSnapshot::load(self.store.as_ref(), plan_id)?;
        let stats = DashboardStats::compute(&snapshot);
        if let Some(plan) = self
            .store
            .set_plan_progress(plan_id, stats.overall_progress)?
        {
            debug!(
                "Plan {} progress now {}%",
                plan.id, plan.progress_percentage
            );
        }
        Ok(stats)
    }

    /// Keeps figures current for `plan_id` until the returned watch is dropped.
    ///
    /// The receiver holds `None` until the first computation finishes, and
    /// keeps the last good figures when a recompute fails.
    pub fn watch(&self, plan_id: PlanId) -> ProgressWatch {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();
        let handles = [Table::CanvasItems, Table::DetailedSections, Table::CanvasSections]
            .into_iter()
            .map(|table| {
                let dirty = dirty_tx.clone();
                self.feed
                    .subscribe(ResourceDescriptor::for_plan(table, plan_id), move |_| {
                        let _ = dirty.send(());
                    })
            })
            .collect();
        drop(dirty_tx);

        let (stats_tx, stats_rx) = watch::channel(None);
        let tracker = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let pass = tracker.clone();
                match tokio::task::spawn_blocking(move || pass.recompute(plan_id)).await {
                    Ok(Ok(stats)) => {
                        if stats_tx.send(Some(stats)).is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => warn!("Progress recompute for plan {} failed: {}", plan_id, e),
                    Err(e) => {
                        error!("Progress recompute for plan {} panicked: {}", plan_id, e);
                        break;
                    }
                }
                if dirty_rx.recv().await.is_none() {
                    break;
                }
                // Coalesce bursts into one recompute.
                while dirty_rx.try_recv().is_ok() {}
            }
        });

        ProgressWatch {
            feed: self.feed.clone(),
            handles,
            rx: stats_rx,
            task,
        }
    }
}

/// Live dashboard figures for one plan.
pub struct ProgressWatch {
    feed: ChangeFeed,
    handles: Vec<SubscriptionHandle>,
    rx: watch::Receiver<Option<DashboardStats>>,
    task: JoinHandle<()>,
}

impl ProgressWatch {
    pub fn current(&self) -> Option<DashboardStats> {
        self.rx.borrow().clone()
    }

    /// Waits for the next published figures.
    pub async fn changed(&mut self) -> Result<DashboardStats> {
        loop {
            self.rx
                .changed()
                .await
                .map_err(|_| CollaborationError::ChannelClosed("progress".to_string()))?;
            if let Some(stats) = self.rx.borrow_and_update().clone() {
                return Ok(stats);
            }
        }
    }
}

impl Drop for ProgressWatch {
    fn drop(&mut self) {
        for handle in &self.handles {
            self.feed.unsubscribe(handle);
        }
        self.task.abort();
    }
}
