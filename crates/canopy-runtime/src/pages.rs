//! Page graph - the app's pages, their order and the home page

use crate::{EventAction, Page, RuntimeError};
use serde::{Deserialize, Serialize};

/// A structural edit from the page selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "edit", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PageEdit {
    AddPage { name: String },
    DeletePage { page_id: String },
    RenamePage { page_id: String, name: String },
    HidePage { page_id: String },
    UnhidePage { page_id: String },
    SetHomePage { page_id: String },
    UpdateHandle { page_id: String, handle: String },
    ClonePage { page_id: String },
    /// New order; must be a permutation of the current page ids
    ReorderPages { order: Vec<String> },
    UpdatePageEvents { page_id: String, events: Vec<EventAction> },
}

impl PageEdit {
    pub fn name(&self) -> &'static str {
        match self {
            PageEdit::AddPage { .. } => "add page",
            PageEdit::DeletePage { .. } => "delete page",
            PageEdit::RenamePage { .. } => "rename page",
            PageEdit::HidePage { .. } => "hide page",
            PageEdit::UnhidePage { .. } => "unhide page",
            PageEdit::SetHomePage { .. } => "set home page",
            PageEdit::UpdateHandle { .. } => "update page handle",
            PageEdit::ClonePage { .. } => "clone page",
            PageEdit::ReorderPages { .. } => "reorder pages",
            PageEdit::UpdatePageEvents { .. } => "update page events",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageGraph {
    pages: Vec<Page>,
    home_page_id: String,
    #[serde(skip)]
    next_id: u64,
}

impl PageGraph {
    /// Pages in display order. An app with no pages gets a single `home` page.
    pub fn new(mut pages: Vec<Page>, home_page_id: Option<String>) -> Result<Self, RuntimeError> {
        if pages.is_empty() {
            pages.push(Page {
                id: "home".into(),
                name: "Home".into(),
                handle: "home".into(),
                hidden: false,
                events: Vec::new(),
            });
        }
        for (i, page) in pages.iter().enumerate() {
            if pages[..i].iter().any(|p| p.id == page.id) {
                return Err(RuntimeError::DuplicateId {
                    kind: "page",
                    id: page.id.clone(),
                });
            }
            if pages[..i].iter().any(|p| p.handle == page.handle) {
                return Err(RuntimeError::DuplicateHandle(page.handle.clone()));
            }
        }
        let home_page_id = match home_page_id {
            Some(id) if pages.iter().any(|p| p.id == id) => id,
            Some(id) => return Err(RuntimeError::UnknownPage(id)),
            None => pages[0].id.clone(),
        };
        Ok(Self {
            next_id: pages.len() as u64 + 1,
            pages,
            home_page_id,
        })
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn home_page_id(&self) -> &str {
        &self.home_page_id
    }

    pub fn get(&self, page_id: &str) -> Option<&Page> {
        self.pages.iter().find(|p| p.id == page_id)
    }

    /// Look up by id, falling back to handle
    pub fn resolve(&self, id_or_handle: &str) -> Option<&Page> {
        self.get(id_or_handle)
            .or_else(|| self.pages.iter().find(|p| p.handle == id_or_handle))
    }

    /// Apply an edit. On error the graph is unchanged.
    /// Returns the id of the page the edit created or touched.
    pub fn apply(&mut self, edit: PageEdit) -> Result<String, RuntimeError> {
        match edit {
            PageEdit::AddPage { name } => Ok(self.add(name, Vec::new())),
            PageEdit::DeletePage { page_id } => {
                self.index_of(&page_id)?;
                if self.pages.len() == 1 {
                    return Err(RuntimeError::PageDeletion {
                        page: page_id,
                        reason: "an app needs at least one page",
                    });
                }
                if page_id == self.home_page_id {
                    return Err(RuntimeError::PageDeletion {
                        page: page_id,
                        reason: "it is the home page",
                    });
                }
                self.pages.retain(|p| p.id != page_id);
                Ok(page_id)
            }
            PageEdit::RenamePage { page_id, name } => {
                let i = self.index_of(&page_id)?;
                self.pages[i].name = name;
                Ok(page_id)
            }
            PageEdit::HidePage { page_id } => self.set_hidden(page_id, true),
            PageEdit::UnhidePage { page_id } => self.set_hidden(page_id, false),
            PageEdit::SetHomePage { page_id } => {
                self.index_of(&page_id)?;
                self.home_page_id = page_id.clone();
                Ok(page_id)
            }
            PageEdit::UpdateHandle { page_id, handle } => {
                let i = self.index_of(&page_id)?;
                let handle = slugify(&handle);
                if self.pages.iter().any(|p| p.handle == handle && p.id != page_id) {
                    return Err(RuntimeError::DuplicateHandle(handle));
                }
                self.pages[i].handle = handle;
                Ok(page_id)
            }
            PageEdit::ClonePage { page_id } => {
                let source = self.pages[self.index_of(&page_id)?].clone();
                Ok(self.add(format!("{} copy", source.name), source.events))
            }
            PageEdit::ReorderPages { order } => {
                let mut sorted = order.clone();
                sorted.sort();
                sorted.dedup();
                let mut current: Vec<String> = self.pages.iter().map(|p| p.id.clone()).collect();
                current.sort();
                if sorted.len() != order.len() || sorted != current {
                    return Err(RuntimeError::InvalidPageOrder(order.join(", ")));
                }
                let mut reordered = Vec::with_capacity(order.len());
                for id in &order {
                    let i = self.index_of(id)?;
                    reordered.push(self.pages[i].clone());
                }
                self.pages = reordered;
                Ok(self.home_page_id.clone())
            }
            PageEdit::UpdatePageEvents { page_id, events } => {
                let i = self.index_of(&page_id)?;
                self.pages[i].events = events;
                Ok(page_id)
            }
        }
    }

    fn add(&mut self, name: String, events: Vec<EventAction>) -> String {
        let mut id = format!("page-{}", self.next_id);
        while self.get(&id).is_some() {
            self.next_id += 1;
            id = format!("page-{}", self.next_id);
        }
        self.next_id += 1;
        let handle = self.unique_handle(&slugify(&name));
        self.pages.push(Page {
            id: id.clone(),
            name,
            handle,
            hidden: false,
            events,
        });
        id
    }

    fn set_hidden(&mut self, page_id: String, hidden: bool) -> Result<String, RuntimeError> {
        let i = self.index_of(&page_id)?;
        self.pages[i].hidden = hidden;
        Ok(page_id)
    }

    fn index_of(&self, page_id: &str) -> Result<usize, RuntimeError> {
        self.pages
            .iter()
            .position(|p| p.id == page_id)
            .ok_or_else(|| RuntimeError::UnknownPage(page_id.to_string()))
    }

    fn unique_handle(&self, base: &str) -> String {
        let base = if base.is_empty() { "page" } else { base };
        let mut handle = base.to_string();
        let mut n = 2;
        while self.pages.iter().any(|p| p.handle == handle) {
            handle = format!("{}-{}", base, n);
            n += 1;
        }
        handle
    }
}

/// Lowercase, dash-separated handle text
fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
