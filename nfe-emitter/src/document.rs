//! Assembly of the unsigned invoice document from a sale record.

use rand::{CryptoRng, RngCore};
use rust_decimal::Decimal;
use std::str::FromStr;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime, UtcOffset};
use tracing::{debug, instrument};

use crate::{
    access_key::{AccessKey, AccessKeyParams},
    constants::{EMISSION_TYPE_NORMAL, LAYOUT_VERSION, MODEL_NFE, NFE_NAMESPACE},
    money::Amount,
    tax_id::TaxId,
    types::{
        Environment, InvoiceSeries, IssuerProfile, ProductDefaults, SaleItem, SaleRecord, TaxRule,
    },
    xml::Element,
    ValidationError,
};

mod sections;

const EMISSION_TIME_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
);

/// A fully assembled document that has not been signed yet.
#[derive(Debug, Clone)]
pub struct UnsignedInvoice {
    access_key: AccessKey,
    series: InvoiceSeries,
    environment: Environment,
    total: Amount,
    root: Element,
}

impl UnsignedInvoice {
    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn series(&self) -> InvoiceSeries {
        self.series
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Document total (`vNF`).
    pub fn total(&self) -> Amount {
        self.total
    }

    /// The `NFe` element.
    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn to_xml(&self) -> String {
        self.root.to_xml()
    }
}

/// What a single build needs besides configuration.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub sale: &'a SaleRecord,
    pub series: InvoiceSeries,
    pub environment: Environment,
    pub issued_at: OffsetDateTime,
}

pub(crate) struct PricedItem<'a> {
    pub(crate) position: usize,
    pub(crate) item: &'a SaleItem,
    pub(crate) unit_price: Amount,
    pub(crate) total: Amount,
}

/// Sale data that passed validation, ready to be laid out.
pub struct ValidatedSale<'a> {
    sale: &'a SaleRecord,
    recipient: TaxId,
    items: Vec<PricedItem<'a>>,
    total: Amount,
}

impl ValidatedSale<'_> {
    pub fn total(&self) -> Amount {
        self.total
    }
}

/// Builds documents for one issuer. Holds only configuration, so one builder
/// can serve any number of emissions.
#[derive(Debug, Clone, Copy)]
pub struct DocumentBuilder<'a> {
    issuer: &'a IssuerProfile,
    products: &'a ProductDefaults,
    tax: &'a TaxRule,
}

impl<'a> DocumentBuilder<'a> {
    pub fn new(issuer: &'a IssuerProfile, products: &'a ProductDefaults, tax: &'a TaxRule) -> Self {
        Self {
            issuer,
            products,
            tax,
        }
    }

    /// Check everything about the sale that can fail, without drawing a key
    /// or a number. Callers run this before reserving an invoice number so
    /// that bad input does not burn one.
    pub fn validate_sale<'s>(&self, sale: &'s SaleRecord) -> Result<ValidatedSale<'s>, ValidationError> {
        sale.ensure_approved()?;
        if sale.items.is_empty() {
            return Err(ValidationError::NoItems);
        }

        let recipient: TaxId = sale
            .buyer
            .tax_id
            .as_deref()
            .filter(|tax_id| !tax_id.trim().is_empty())
            .ok_or(ValidationError::MissingRecipientTaxId)?
            .parse()?;
        if sale.buyer.name.trim().is_empty() {
            return Err(ValidationError::field("buyer.name", "is empty"));
        }

        let items = sale
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let position = index + 1;
                if item.quantity == 0 {
                    return Err(ValidationError::InvalidItemQuantity {
                        item: position,
                        name: item.name.clone(),
                        quantity: item.quantity,
                    });
                }
                if item.name.trim().is_empty() {
                    return Err(ValidationError::field("items.name", format!("item {position} has no name")));
                }
                let unit_price = item.unit_price(position)?;
                let total = unit_price.checked_mul(item.quantity).map_err(|source| {
                    ValidationError::ItemTotalOutOfRange {
                        item: position,
                        name: item.name.clone(),
                        source,
                    }
                })?;
                Ok(PricedItem {
                    position,
                    item,
                    unit_price,
                    total,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let total = Amount::checked_sum(items.iter().map(|item| item.total))
            .map_err(ValidationError::TotalOutOfRange)?;
        if total.is_zero() {
            return Err(ValidationError::ZeroTotal);
        }

        Ok(ValidatedSale {
            sale,
            recipient,
            items,
            total,
        })
    }

    /// Build the document with a freshly generated access key.
    pub fn build(
        &self,
        request: &BuildRequest<'_>,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<UnsignedInvoice, ValidationError> {
        let issued_at = self.local_time(request.issued_at)?;
        let key = AccessKey::generate(&self.key_params(request.series, issued_at), rng)?;
        self.build_with_key(request, key)
    }

    /// Build the document around an already derived access key. The key must
    /// belong to this issuer, series and number.
    #[instrument(skip_all, err(Debug), fields(access_key = %access_key, series = %request.series))]
    pub fn build_with_key(
        &self,
        request: &BuildRequest<'_>,
        access_key: AccessKey,
    ) -> Result<UnsignedInvoice, ValidationError> {
        self.issuer.validate()?;
        self.tax.validate()?;
        let validated = self.validate_sale(request.sale)?;

        let issued_at = self.local_time(request.issued_at)?;
        let expected = AccessKey::compose(
            &self.key_params(request.series, issued_at),
            access_key
                .nonce()
                .parse()
                .map_err(|_| ValidationError::InvalidAccessKey(access_key.to_string()))?,
        )?;
        if expected != access_key {
            return Err(ValidationError::InvalidAccessKey(format!(
                "{access_key} does not match issuer, series, number or emission month"
            )));
        }

        let issued_at_text = issued_at
            .format(EMISSION_TIME_FORMAT)
            .map_err(|e| ValidationError::field("dhEmi", e.to_string()))?;

        let identification = sections::Identification {
            issuer: self.issuer,
            access_key: &access_key,
            series: request.series,
            environment: request.environment,
            emission_type: EMISSION_TYPE_NORMAL,
            issued_at: &issued_at_text,
        };

        let sale = validated.sale;
        let uses_csosn = self.issuer.tax_regime.uses_csosn();
        let mut info = Element::new("infNFe")
            .with_attribute("Id", access_key.document_id())
            .with_attribute("versao", LAYOUT_VERSION)
            .with_child(sections::ide(&identification))
            .with_child(sections::emit(self.issuer))
            .with_child(sections::dest(
                &validated.recipient,
                &sale.buyer.name,
                sale.buyer.email.as_deref(),
                request.environment,
            ))
            .with_children(
                validated
                    .items
                    .iter()
                    .map(|item| sections::det(item, self.products, self.tax, uses_csosn)),
            )
            .with_child(sections::total(validated.total))
            .with_child(sections::transp())
            .with_child(sections::pag(sale.payment, validated.total));
        if !sale.reference.0.trim().is_empty() {
            info.push_child(sections::inf_adic(&format!("Pedido {}", sale.reference)));
        }

        verify_totals(&info)?;
        debug!(total = %validated.total, items = validated.items.len(), "Document assembled");

        Ok(UnsignedInvoice {
            access_key,
            series: request.series,
            environment: request.environment,
            total: validated.total,
            root: Element::new("NFe")
                .with_attribute("xmlns", NFE_NAMESPACE)
                .with_child(info),
        })
    }

    fn local_time(&self, at: OffsetDateTime) -> Result<OffsetDateTime, ValidationError> {
        let offset = UtcOffset::from_hms(self.issuer.utc_offset_hours, 0, 0)
            .map_err(|e| ValidationError::field("issuer.utc_offset_hours", e.to_string()))?;
        Ok(at.to_offset(offset))
    }

    fn key_params(&self, series: InvoiceSeries, issued_at: OffsetDateTime) -> AccessKeyParams<'a> {
        AccessKeyParams {
            uf: self.issuer.address.uf,
            issued_at,
            issuer: &self.issuer.cnpj,
            model: MODEL_NFE,
            series,
            emission_type: EMISSION_TYPE_NORMAL,
        }
    }
}

/// Re-read the assembled section values and check that item totals, the
/// declared totals and the payment agree to the cent.
fn verify_totals(info: &Element) -> Result<(), ValidationError> {
    let read = |element: Option<&Element>, what: &'static str| -> Result<Decimal, ValidationError> {
        element
            .map(Element::text)
            .and_then(|text| Decimal::from_str(&text).ok())
            .ok_or_else(|| ValidationError::field(what, "missing or not a number"))
    };

    let mut items = Decimal::ZERO;
    for det in info.children_named("det") {
        items += read(det.child("prod").and_then(|prod| prod.child("vProd")), "det/prod/vProd")?;
    }

    let icms_tot = info.child("total").and_then(|total| total.child("ICMSTot"));
    let declared_products = read(icms_tot.and_then(|tot| tot.child("vProd")), "ICMSTot/vProd")?;
    let declared_total = read(icms_tot.and_then(|tot| tot.child("vNF")), "ICMSTot/vNF")?;

    let mut paid = Decimal::ZERO;
    if let Some(pag) = info.child("pag") {
        for detail in pag.children_named("detPag") {
            paid += read(detail.child("vPag"), "detPag/vPag")?;
        }
    }

    if items != declared_products || items != declared_total || items != paid {
        return Err(ValidationError::TotalMismatch {
            items: items.to_string(),
            declared: format!("vProd={declared_products} vNF={declared_total} vPag={paid}"),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{
        issuer::tests::test_issuer, sale::tests::test_sale, PriceInput, SaleStatus, TaxRegime,
    };
    use crate::money::AmountError;
    use rand::{rngs::StdRng, SeedableRng};
    use time::macros::datetime;

    pub(crate) fn build_test_invoice(environment: Environment) -> UnsignedInvoice {
        let issuer = test_issuer();
        let products = ProductDefaults::default();
        let tax = TaxRule::default();
        let sale = test_sale();
        let builder = DocumentBuilder::new(&issuer, &products, &tax);
        builder
            .build(
                &BuildRequest {
                    sale: &sale,
                    series: InvoiceSeries::new(1, 42).unwrap(),
                    environment,
                    issued_at: datetime!(2024-05-14 13:30 UTC),
                },
                &mut StdRng::seed_from_u64(1),
            )
            .unwrap()
    }

    fn decimal(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    #[test]
    fn sections_appear_in_layout_order() {
        let invoice = build_test_invoice(Environment::Production);
        let info = invoice.root().child("infNFe").unwrap();
        let names: Vec<&str> = info.child_elements().map(Element::name).collect();
        assert_eq!(
            names,
            ["ide", "emit", "dest", "det", "det", "total", "transp", "pag", "infAdic"]
        );
        assert_eq!(info.attribute("Id"), Some(invoice.access_key().document_id().as_str()));
        assert_eq!(info.attribute("versao"), Some("4.00"));
        assert_eq!(invoice.root().attribute("xmlns"), Some(NFE_NAMESPACE));
    }

    #[test]
    fn identification_matches_access_key() {
        let invoice = build_test_invoice(Environment::Production);
        let ide = invoice.root().find("ide").unwrap();
        let key = invoice.access_key();

        assert_eq!(ide.child_text("cUF").unwrap(), "29");
        assert_eq!(ide.child_text("cNF").unwrap(), key.nonce());
        assert_eq!(ide.child_text("cDV").unwrap(), key.check_digit().to_string());
        assert_eq!(ide.child_text("nNF").unwrap(), "42");
        assert_eq!(ide.child_text("serie").unwrap(), "1");
        assert_eq!(ide.child_text("tpAmb").unwrap(), "1");
        assert_eq!(ide.child_text("dhEmi").unwrap(), "2024-05-14T10:30:00-03:00");
        assert!(key.as_str().starts_with("29240512345678000195550010000000421"));
    }

    #[test]
    fn item_totals_add_up_to_declared_total() {
        let invoice = build_test_invoice(Environment::Production);
        let info = invoice.root().child("infNFe").unwrap();

        let items: Decimal = info
            .children_named("det")
            .map(|det| decimal(&det.find("vProd").unwrap().text()))
            .sum();
        let icms_tot = info.find("ICMSTot").unwrap();

        // 59.90 + 2 x 42.50
        assert_eq!(items, decimal("144.90"));
        assert_eq!(decimal(&icms_tot.child_text("vProd").unwrap()), items);
        assert_eq!(decimal(&icms_tot.child_text("vNF").unwrap()), items);
        assert_eq!(decimal(&info.find("vPag").unwrap().text()), items);
        assert_eq!(invoice.total().to_string(), "144.90");
    }

    #[test]
    fn item_defaults_and_overrides() {
        let invoice = build_test_invoice(Environment::Production);
        let info = invoice.root().child("infNFe").unwrap();
        let dets: Vec<&Element> = info.children_named("det").collect();

        let first = dets[0].child("prod").unwrap();
        assert_eq!(dets[0].attribute("nItem"), Some("1"));
        assert_eq!(first.child_text("cProd").unwrap(), "1");
        assert_eq!(first.child_text("NCM").unwrap(), "49019900");
        assert_eq!(first.child_text("CFOP").unwrap(), "5102");
        assert_eq!(first.child_text("qCom").unwrap(), "1.0000");
        assert_eq!(first.child_text("vUnCom").unwrap(), "59.90");

        let second = dets[1].child("prod").unwrap();
        assert_eq!(second.child_text("NCM").unwrap(), "49011000");
        assert_eq!(second.child_text("qCom").unwrap(), "2.0000");
        assert_eq!(second.child_text("vProd").unwrap(), "85.00");

        let icms = dets[0].find("ICMS40").unwrap();
        assert_eq!(icms.child_text("CST").unwrap(), "40");
        assert_eq!(dets[0].find("PISNT").unwrap().child_text("CST").unwrap(), "07");
    }

    #[test]
    fn simples_nacional_uses_csosn() {
        let mut issuer = test_issuer();
        issuer.tax_regime = TaxRegime::SimplesNacional;
        let products = ProductDefaults::default();
        let tax = TaxRule::default();
        let sale = test_sale();
        let invoice = DocumentBuilder::new(&issuer, &products, &tax)
            .build(
                &BuildRequest {
                    sale: &sale,
                    series: InvoiceSeries::new(1, 7).unwrap(),
                    environment: Environment::Production,
                    issued_at: datetime!(2024-05-14 13:30 UTC),
                },
                &mut StdRng::seed_from_u64(1),
            )
            .unwrap();

        let icms = invoice.root().find("ICMSSN102").unwrap();
        assert_eq!(icms.child_text("CSOSN").unwrap(), "102");
        assert_eq!(invoice.root().find("CRT").unwrap().text(), "1");
    }

    #[test]
    fn homologation_replaces_recipient_name() {
        let invoice = build_test_invoice(Environment::Homologation);
        let dest = invoice.root().find("dest").unwrap();
        assert_eq!(
            dest.child_text("xNome").unwrap(),
            "NF-E EMITIDA EM AMBIENTE DE HOMOLOGACAO - SEM VALOR FISCAL"
        );
        assert_eq!(dest.child_text("CPF").unwrap(), "12345678909");
        assert_eq!(invoice.root().find("tpAmb").unwrap().text(), "2");

        let production = build_test_invoice(Environment::Production);
        assert_eq!(
            production.root().find("dest").unwrap().child_text("xNome").unwrap(),
            "Maria Souza"
        );
    }

    fn build(sale: &SaleRecord) -> Result<UnsignedInvoice, ValidationError> {
        let issuer = test_issuer();
        let products = ProductDefaults::default();
        let tax = TaxRule::default();
        DocumentBuilder::new(&issuer, &products, &tax).build(
            &BuildRequest {
                sale,
                series: InvoiceSeries::new(1, 42).unwrap(),
                environment: Environment::Production,
                issued_at: datetime!(2024-05-14 13:30 UTC),
            },
            &mut StdRng::seed_from_u64(1),
        )
    }

    #[test]
    fn unparseable_price_is_an_error_not_zero() {
        let mut sale = test_sale();
        sale.items[1].price = PriceInput::Text("R$ quarenta".to_string());
        match build(&sale) {
            Err(ValidationError::InvalidItemPrice { item, .. }) => assert_eq!(item, 2),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn totals_past_thirteen_digits_are_refused() {
        let mut sale = test_sale();
        sale.items[0].price = PriceInput::Text("79228162514264337593543950335".to_string());
        sale.items[0].quantity = 2;
        assert!(matches!(
            build(&sale),
            Err(ValidationError::InvalidItemPrice {
                item: 1,
                source: AmountError::TooLarge,
                ..
            })
        ));

        let mut sale = test_sale();
        sale.items[0].price = PriceInput::Text("R$ 12.345.678.901.234,00".to_string());
        assert!(matches!(
            build(&sale),
            Err(ValidationError::InvalidItemPrice {
                source: AmountError::TooLarge,
                ..
            })
        ));

        let mut sale = test_sale();
        sale.items[0].price = PriceInput::Text("5.000.000.000.000,00".to_string());
        sale.items[0].quantity = 2;
        assert!(matches!(
            build(&sale),
            Err(ValidationError::ItemTotalOutOfRange { item: 1, .. })
        ));

        let mut sale = test_sale();
        for item in &mut sale.items {
            item.price = PriceInput::Text("9.000.000.000.000,00".to_string());
            item.quantity = 1;
        }
        assert!(matches!(
            build(&sale),
            Err(ValidationError::TotalOutOfRange(AmountError::TooLarge))
        ));
    }

    #[test]
    fn invalid_inputs_are_refused() {
        let mut sale = test_sale();
        sale.buyer.tax_id = None;
        assert!(matches!(build(&sale), Err(ValidationError::MissingRecipientTaxId)));

        let mut sale = test_sale();
        sale.buyer.tax_id = Some("123.456.789-00".to_string());
        assert!(matches!(build(&sale), Err(ValidationError::InvalidCpf(_))));

        let mut sale = test_sale();
        sale.items.clear();
        assert!(matches!(build(&sale), Err(ValidationError::NoItems)));

        let mut sale = test_sale();
        for item in &mut sale.items {
            item.price = PriceInput::Text("0,00".to_string());
        }
        assert!(matches!(build(&sale), Err(ValidationError::ZeroTotal)));

        let mut sale = test_sale();
        sale.status = SaleStatus::Declined;
        assert!(matches!(build(&sale), Err(ValidationError::SaleNotApproved { .. })));
    }

    #[test]
    fn foreign_access_key_is_refused() {
        let issuer = test_issuer();
        let products = ProductDefaults::default();
        let tax = TaxRule::default();
        let sale = test_sale();
        let request = BuildRequest {
            sale: &sale,
            series: InvoiceSeries::new(1, 43).unwrap(),
            environment: Environment::Production,
            issued_at: datetime!(2024-05-14 13:30 UTC),
        };
        // Key for number 42, request for number 43.
        let key: AccessKey = "29240512345678000195550010000000421123456789".parse().unwrap();
        assert!(matches!(
            DocumentBuilder::new(&issuer, &products, &tax).build_with_key(&request, key),
            Err(ValidationError::InvalidAccessKey(_))
        ));
    }
}
