use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, DateTime as BsonDateTime, Document};
use mongodb::options::{FindOptions, IndexOptions, UpdateModifications, UpdateOptions};
use mongodb::{Client as MongoClient, ClientSession, Collection, Database, IndexModel};
use std::collections::HashSet;

use super::GraphStore;
use crate::models::*;

const STORES: &str = "stores";
const APPLICATIONS: &str = "applications";
const PRODUCTS: &str = "products";
const VARIANTS: &str = "variants";
const CATEGORIES: &str = "categories";
const DEMOGRAPHICS: &str = "demographics";
const RELATIONSHIPS: &str = "relationships";

const HAS_PRODUCT: &str = "HAS_PRODUCT";
const HAS_CATEGORY: &str = "HAS_CATEGORY";
const IN_CATEGORY: &str = "IN_CATEGORY";
const FOR_DEMOGRAPHIC: &str = "FOR_DEMOGRAPHIC";
const CHILD_OF: &str = "CHILD_OF";

fn store_node(store_id: &str) -> String {
    format!("store:{}", store_id)
}

fn product_node(store_id: &str, product_id: &str) -> String {
    format!("product:{}:{}", store_id, product_id)
}

fn category_node(key: &str) -> String {
    format!("category:{}", key)
}

fn demographic_node(key: &str) -> String {
    format!("demographic:{}", key)
}

/// Graph store over MongoDB: one collection per node label plus an edge collection.
#[derive(Clone)]
pub struct MongoGraphStore {
    client: MongoClient,
    db: Database,
    use_transactions: bool,
}

impl MongoGraphStore {
    pub fn new(client: MongoClient, db: Database, use_transactions: bool) -> Self {
        Self { client, db, use_transactions }
    }

    fn stores(&self) -> Collection<Store> {
        self.db.collection(STORES)
    }

    fn docs(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();
        let specs: Vec<(&str, Document, bool)> = vec![
            (STORES, doc! { "id": 1 }, true),
            (PRODUCTS, doc! { "store_id": 1, "product_id": 1 }, true),
            (VARIANTS, doc! { "store_id": 1, "product_id": 1, "variant_id": 1 }, true),
            (CATEGORIES, doc! { "stores": 1 }, false),
            (RELATIONSHIPS, doc! { "from": 1, "rel": 1, "to": 1 }, true),
            (RELATIONSHIPS, doc! { "to": 1, "rel": 1 }, false),
        ];
        for (collection, keys, is_unique) in specs {
            let model = if is_unique {
                IndexModel::builder().keys(keys).options(unique()).build()
            } else {
                IndexModel::builder().keys(keys).build()
            };
            self.docs(collection).create_index(model, None).await?;
        }
        tracing::info!("Graph store indexes ensured");
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: Document,
        update: impl Into<UpdateModifications>,
        session: Option<&mut ClientSession>,
    ) -> Result<()> {
        let options = UpdateOptions::builder().upsert(true).build();
        let coll = self.docs(collection);
        match session {
            Some(s) => {
                coll.update_one_with_session(filter, update, options, s).await?;
            }
            None => {
                coll.update_one(filter, update, options).await?;
            }
        }
        Ok(())
    }

    async fn link(&self, from: String, rel: &str, to: String, session: Option<&mut ClientSession>) -> Result<()> {
        let filter = doc! { "from": from, "rel": rel, "to": to };
        let update = doc! { "$setOnInsert": { "created_at": BsonDateTime::now() } };
        self.upsert(RELATIONSHIPS, filter, update, session).await
    }

    async fn merge_label(
        &self,
        collection: &str,
        name: &str,
        store_id: &str,
        session: Option<&mut ClientSession>,
    ) -> Result<String> {
        let key = label_key(name);
        let update = doc! {
            "$setOnInsert": { "name": name.trim(), "created_at": BsonDateTime::now() },
            "$addToSet": { "stores": store_id },
        };
        self.upsert(collection, doc! { "_id": &key }, update, session).await?;
        Ok(key)
    }

    async fn replace_variants(
        &self,
        product: &Product,
        store_id: &str,
        mut session: Option<&mut ClientSession>,
    ) -> Result<()> {
        let coll = self.docs(VARIANTS);
        let filter = doc! { "store_id": store_id, "product_id": &product.id };
        match session.as_deref_mut() {
            Some(s) => {
                coll.delete_many_with_session(filter, None, s).await?;
            }
            None => {
                coll.delete_many(filter, None).await?;
            }
        }
        if product.variants.is_empty() {
            return Ok(());
        }

        let docs = product
            .variants
            .iter()
            .map(|v| variant_document(v, &product.id, store_id))
            .collect::<Result<Vec<_>>>()?;
        match session {
            Some(s) => {
                coll.insert_many_with_session(docs, None, s).await?;
            }
            None => {
                coll.insert_many(docs, None).await?;
            }
        }
        Ok(())
    }

    async fn write_product(
        &self,
        product: &Product,
        store_id: &str,
        mut session: Option<&mut ClientSession>,
    ) -> Result<()> {
        let filter = doc! { "store_id": store_id, "product_id": &product.id };
        let mut set: Document = product_document(product, store_id)?
            .into_iter()
            .map(|(k, v)| (k, Bson::Document(doc! { "$literal": v })))
            .collect();
        // An existing sku and creation time survive re-syncs
        set.insert("sku", doc! { "$ifNull": ["$sku", { "$literal": product.sku.clone() }] });
        set.insert("created_at", doc! { "$ifNull": ["$created_at", { "$literal": BsonDateTime::now() }] });
        self.upsert(PRODUCTS, filter, vec![doc! { "$set": set }], session.as_deref_mut())
            .await?;

        self.replace_variants(product, store_id, session.as_deref_mut()).await?;

        let node = product_node(store_id, &product.id);
        self.link(store_node(store_id), HAS_PRODUCT, node.clone(), session.as_deref_mut())
            .await?;

        let mut labels: Vec<&str> = product.raw_categories.iter().map(String::as_str).collect();
        if let Some(category) = &product.category {
            labels.push(category);
        }
        let mut seen = HashSet::new();
        for label in labels.into_iter().filter(|l| !l.trim().is_empty()) {
            if !seen.insert(label_key(label)) {
                continue;
            }
            let key = self
                .merge_label(CATEGORIES, label, store_id, session.as_deref_mut())
                .await?;
            self.link(node.clone(), IN_CATEGORY, category_node(&key), session.as_deref_mut())
                .await?;
        }

        for demographic in &product.demographics {
            let key = self
                .merge_label(DEMOGRAPHICS, demographic, store_id, session.as_deref_mut())
                .await?;
            self.link(node.clone(), FOR_DEMOGRAPHIC, demographic_node(&key), session.as_deref_mut())
                .await?;
        }
        Ok(())
    }

    async fn write_batch(
        &self,
        products: &[Product],
        store_id: &str,
        mut session: Option<&mut ClientSession>,
    ) -> Result<()> {
        for product in products {
            self.write_product(product, store_id, session.as_deref_mut()).await?;
        }
        Ok(())
    }
}

fn product_document(product: &Product, store_id: &str) -> Result<Document> {
    Ok(doc! {
        "store_id": store_id,
        "product_id": &product.id,
        "title": &product.title,
        "description": &product.description,
        "description_source": to_bson(&product.description_source)?,
        "handle": product.handle.clone(),
        "vendor": product.vendor.clone(),
        "product_type": product.product_type.clone(),
        "tags": product.tags.clone(),
        "raw_categories": product.raw_categories.clone(),
        "category": product.category.clone(),
        "demographics": product.demographics.iter().cloned().collect::<Vec<_>>(),
        "properties": to_bson(&product.properties)?,
        "style_code": product.style_code.clone(),
        "embeddings": to_bson(&product.embeddings)?,
        "images": product.images.clone(),
        "variant_ids": product.variants.iter().map(|v| v.id.clone()).collect::<Vec<_>>(),
        "min_price": product.min_price(),
        "updated_at": BsonDateTime::now(),
    })
}

fn variant_document(variant: &Variant, product_id: &str, store_id: &str) -> Result<Document> {
    Ok(doc! {
        "store_id": store_id,
        "product_id": product_id,
        "variant_id": &variant.id,
        "title": variant.title.clone(),
        "sku": variant.sku.clone(),
        "price": variant.price,
        "compare_at_price": variant.compare_at_price,
        "size": variant.size.clone(),
        "color": variant.color.clone(),
        "inventory_quantity": variant.inventory_quantity,
        "available": variant.available,
        "embeddings": to_bson(&variant.embeddings)?,
    })
}

#[async_trait]
impl GraphStore for MongoGraphStore {
    async fn load_store(&self, store_id: &str) -> Result<Option<Store>> {
        Ok(self.stores().find_one(doc! { "id": store_id }, None).await?)
    }

    async fn list_stores(&self) -> Result<Vec<Store>> {
        let cursor = self.stores().find(None, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn upsert_application_and_store(&self, store: &Store, metadata: &ShopMetadata) -> Result<()> {
        let now = to_bson(&Utc::now())?;
        self.upsert(
            APPLICATIONS,
            doc! { "_id": &store.application_id },
            doc! {
                "$addToSet": { "stores": &store.id },
                "$set": { "updated_at": BsonDateTime::now() },
                "$setOnInsert": { "created_at": BsonDateTime::now() },
            },
            None,
        )
        .await?;

        let name = metadata.name.clone().or_else(|| store.name.clone());
        let currency = metadata.currency.clone().or_else(|| store.currency.clone());
        self.upsert(
            STORES,
            doc! { "id": &store.id },
            doc! {
                "$set": {
                    "name": name,
                    "currency": currency,
                    "application_id": &store.application_id,
                    "platform": to_bson(&store.platform)?,
                    "base_url": store.base_url.clone(),
                    "updated_at": now.clone(),
                },
                "$setOnInsert": {
                    "status": to_bson(&StoreStatus::Pending)?,
                    "created_at": now,
                },
            },
            None,
        )
        .await?;
        tracing::debug!(store_id = %store.id, application_id = %store.application_id, "Store node upserted");
        Ok(())
    }

    async fn upsert_categories(&self, store_id: &str, categories: &[Category]) -> Result<usize> {
        for category in categories {
            let key = category.key();
            let mut set = doc! { "name": category.name.trim(), "updated_at": BsonDateTime::now() };
            if let Some(parent) = &category.parent {
                set.insert("parent", label_key(parent));
            }
            if let Some(external_id) = &category.external_id {
                set.insert("external_id", external_id);
            }
            self.upsert(
                CATEGORIES,
                doc! { "_id": &key },
                doc! {
                    "$set": set,
                    "$addToSet": { "stores": store_id },
                    "$setOnInsert": { "created_at": BsonDateTime::now() },
                },
                None,
            )
            .await?;
            self.link(store_node(store_id), HAS_CATEGORY, category_node(&key), None).await?;
            if let Some(parent) = &category.parent {
                self.link(category_node(&key), CHILD_OF, category_node(&label_key(parent)), None)
                    .await?;
            }
        }
        Ok(categories.len())
    }

    async fn category_names(&self, store_id: &str) -> Result<Vec<String>> {
        let options = FindOptions::builder().projection(doc! { "name": 1 }).build();
        let docs: Vec<Document> = self
            .docs(CATEGORIES)
            .find(doc! { "stores": store_id }, options)
            .await?
            .try_collect()
            .await?;
        Ok(docs
            .iter()
            .filter_map(|d| d.get_str("name").ok().map(str::to_string))
            .collect())
    }

    async fn existing_product_ids(&self, store_id: &str, candidate_ids: &[String]) -> Result<HashSet<String>> {
        if candidate_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let filter = doc! { "store_id": store_id, "product_id": { "$in": candidate_ids.to_vec() } };
        let options = FindOptions::builder().projection(doc! { "product_id": 1 }).build();
        let docs: Vec<Document> = self.docs(PRODUCTS).find(filter, options).await?.try_collect().await?;
        Ok(docs
            .iter()
            .filter_map(|d| d.get_str("product_id").ok().map(str::to_string))
            .collect())
    }

    async fn save_product_batch(&self, products: &[Product], store_id: &str) -> Result<()> {
        if products.is_empty() {
            return Ok(());
        }
        if !self.use_transactions {
            return self.write_batch(products, store_id, None).await;
        }

        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        match self.write_batch(products, store_id, Some(&mut session)).await {
            Ok(()) => {
                session.commit_transaction().await?;
                tracing::debug!(store_id = %store_id, products = products.len(), "Product batch committed");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(store_id = %store_id, error = %abort_err, "Failed to abort product batch transaction");
                }
                Err(e)
            }
        }
    }

    async fn update_store_status(
        &self,
        store_id: &str,
        status: StoreStatus,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut set = doc! { "status": to_bson(&status)?, "updated_at": to_bson(&Utc::now())? };
        if let Some(ts) = last_sync {
            set.insert("last_sync", to_bson(&ts)?);
        }
        self.stores()
            .update_one(doc! { "id": store_id }, doc! { "$set": set }, None)
            .await?;
        Ok(())
    }

    async fn compute_store_context(&self, store_id: &str) -> Result<StoreContext> {
        let options = FindOptions::builder()
            .projection(doc! { "category": 1, "demographics": 1, "min_price": 1 })
            .build();
        let mut cursor = self.docs(PRODUCTS).find(doc! { "store_id": store_id }, options).await?;

        let mut context = StoreContext::default();
        while let Some(doc) = cursor.try_next().await? {
            context.product_count += 1;
            if let Ok(category) = doc.get_str("category") {
                *context.categories.entry(label_key(category)).or_insert(0) += 1;
            }
            if let Ok(demographics) = doc.get_array("demographics") {
                for d in demographics.iter().filter_map(Bson::as_str) {
                    *context.demographics.entry(label_key(d)).or_insert(0) += 1;
                }
            }
            if let Ok(price) = doc.get_f64("min_price") {
                context.price_min = Some(context.price_min.map_or(price, |m| m.min(price)));
                context.price_max = Some(context.price_max.map_or(price, |m| m.max(price)));
            }
        }
        Ok(context)
    }

    async fn save_store_context(&self, store_id: &str, context: &StoreContext) -> Result<()> {
        self.stores()
            .update_one(
                doc! { "id": store_id },
                doc! { "$set": { "context": to_bson(context)?, "updated_at": to_bson(&Utc::now())? } },
                None,
            )
            .await?;
        Ok(())
    }
}
