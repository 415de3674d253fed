use std::cmp::Ordering;

/// One priced item from a price list.
///
/// Records are ordered by `(price, name, condition, state, id)` and two records
/// are equal only when that comparison says so, which makes the ordering usable
/// as a deduplication key in ordered sets.
#[derive(Debug, Clone)]
pub struct Record {
    id: i64,
    name: String,
    condition: String,
    state: String,
    price: f32,
}

impl Record {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        condition: impl Into<String>,
        state: impl Into<String>,
        price: f32,
    ) -> Self {
        Record {
            id,
            name: name.into(),
            condition: condition.into(),
            state: state.into(),
            price,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn price(&self) -> f32 {
        self.price
    }

    /// Text of a single output column.
    pub fn field_value(&self, field: Field) -> String {
        match field {
            Field::Id => self.id.to_string(),
            Field::Name => self.name.clone(),
            Field::Condition => self.condition.clone(),
            Field::State => self.state.clone(),
            Field::Price => self.price.to_string(),
        }
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.price
            .total_cmp(&other.price)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.condition.cmp(&other.condition))
            .then_with(|| self.state.cmp(&other.state))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Record {}

/// Output columns, in the order a sink should emit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    Name,
    Condition,
    State,
    Price,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Id,
        Field::Name,
        Field::Condition,
        Field::State,
        Field::Price,
    ];

    /// Column title used in header rows, both when reading and writing.
    pub fn header(self) -> &'static str {
        match self {
            Field::Id => "product ID",
            Field::Name => "Name",
            Field::Condition => "Condition",
            Field::State => "State",
            Field::Price => "Price",
        }
    }
}
